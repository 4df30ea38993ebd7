use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    api_base_from_env, elapsed_ms, non_empty_env, response_json_or_error, usage_count,
    GenerateRequest, ProviderResponse, VisionProvider,
};

/// Chat Completions with an inline `data:` URL image part.
pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }

    fn build_payload(request: &GenerateRequest<'_>) -> Value {
        let user_content = match request.image {
            Some(image) => json!([
                {"type": "text", "text": request.user_prompt},
                {"type": "image_url", "image_url": {"url": image.data_url()}},
            ]),
            None => Value::String(request.user_prompt.to_string()),
        };
        json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": user_content},
            ],
            "max_completion_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        let api_key = Self::api_key().context("OPENAI_API_KEY not set")?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = Self::build_payload(request);

        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        let latency_ms = elapsed_ms(started);

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ProviderResponse {
            content,
            prompt_tokens: usage_count(&parsed, "/usage/prompt_tokens"),
            completion_tokens: usage_count(&parsed, "/usage/completion_tokens"),
            latency_ms,
        })
    }
}
