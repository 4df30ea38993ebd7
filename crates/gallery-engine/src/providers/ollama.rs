use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    api_base_from_env, elapsed_ms, response_json_or_error, usage_count, GenerateRequest,
    ProviderResponse, VisionProvider,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

pub struct OllamaProvider {
    base_url: String,
    http: HttpClient,
}

impl OllamaProvider {
    pub fn new() -> Self {
        Self {
            base_url: api_base_from_env("OLLAMA_BASE_URL", "http://localhost:11434"),
            http: HttpClient::new(),
        }
    }

    fn build_payload(request: &GenerateRequest<'_>) -> Value {
        let mut user = json!({"role": "user", "content": request.user_prompt});
        if let Some(image) = request.image {
            user["images"] = json!([image.base64()]);
        }
        json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                user,
            ],
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        })
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let payload = Self::build_payload(request);

        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .with_context(|| format!("Ollama request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Ollama", response)?;
        let latency_ms = elapsed_ms(started);

        let content = parsed
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ProviderResponse {
            content,
            prompt_tokens: usage_count(&parsed, "/prompt_eval_count"),
            completion_tokens: usage_count(&parsed, "/eval_count"),
            latency_ms,
        })
    }
}
