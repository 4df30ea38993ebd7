use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    api_base_from_env, elapsed_ms, non_empty_env, response_json_or_error, usage_count,
    GenerateRequest, ProviderResponse, VisionProvider,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API; the image goes first as a base64 source block.
pub struct AnthropicProvider {
    api_base: String,
    http: HttpClient,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("ANTHROPIC_API_BASE", "https://api.anthropic.com/v1"),
            http: HttpClient::new(),
        }
    }

    fn build_payload(request: &GenerateRequest<'_>) -> Value {
        let mut content = Vec::new();
        if let Some(image) = request.image {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.mime_type,
                    "data": image.base64(),
                }
            }));
        }
        content.push(json!({"type": "text", "text": request.user_prompt}));
        json!({
            "model": request.model,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": content}],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }

    fn extract_text(payload: &Value) -> String {
        payload
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        let api_key = non_empty_env("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY not set")?;
        let endpoint = format!("{}/messages", self.api_base);
        let payload = Self::build_payload(request);

        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .with_context(|| format!("Anthropic request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Anthropic", response)?;
        let latency_ms = elapsed_ms(started);

        Ok(ProviderResponse {
            content: Self::extract_text(&parsed),
            prompt_tokens: usage_count(&parsed, "/usage/input_tokens"),
            completion_tokens: usage_count(&parsed, "/usage/output_tokens"),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageBytes;

    #[test]
    fn payload_places_image_before_text() {
        let image = ImageBytes::new(vec![0xff], "image/jpeg");
        let request = GenerateRequest {
            model: "claude-opus-4-6",
            system_prompt: "sys",
            user_prompt: "look",
            image: Some(&image),
            temperature: 0.7,
            max_tokens: 100,
        };
        let payload = AnthropicProvider::build_payload(&request);
        assert_eq!(payload["system"], json!("sys"));
        let content = &payload["messages"][0]["content"];
        assert_eq!(content[0]["source"]["media_type"], json!("image/jpeg"));
        assert_eq!(content[0]["source"]["data"], json!("/w=="));
        assert_eq!(content[1]["text"], json!("look"));
    }

    #[test]
    fn extract_text_joins_text_blocks() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "SCORE: 4"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "\nRATIONALE: ok"}
            ]
        });
        assert_eq!(AnthropicProvider::extract_text(&payload), "SCORE: 4\nRATIONALE: ok");
    }
}
