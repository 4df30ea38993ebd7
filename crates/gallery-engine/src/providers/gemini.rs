use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    api_base_from_env, elapsed_ms, non_empty_env, response_json_or_error, usage_count,
    GenerateRequest, ProviderResponse, VisionProvider,
};

/// `generateContent` with the image as an `inlineData` part.
pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerateRequest<'_>) -> Value {
        let mut parts = Vec::new();
        if let Some(image) = request.image {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": image.base64(),
                }
            }));
        }
        parts.push(json!({"text": request.user_prompt}));
        json!({
            "systemInstruction": {"parts": [{"text": request.system_prompt}]},
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        })
    }

    fn extract_text(payload: &Value) -> String {
        payload
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        let api_key = Self::api_key().context("GEMINI_API_KEY or GOOGLE_API_KEY not set")?;
        let endpoint = self.endpoint_for_model(request.model);
        let payload = Self::build_payload(request);

        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini", response)?;
        let latency_ms = elapsed_ms(started);

        Ok(ProviderResponse {
            content: Self::extract_text(&parsed),
            prompt_tokens: usage_count(&parsed, "/usageMetadata/promptTokenCount"),
            completion_tokens: usage_count(&parsed, "/usageMetadata/candidatesTokenCount"),
            latency_ms,
        })
    }
}
