use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;

use crate::images::ImageBytes;

mod anthropic;
mod dryrun;
mod gemini;
mod ollama;
mod openai;
#[cfg(test)]
pub(crate) mod scripted;

pub use anthropic::AnthropicProvider;
pub use dryrun::DryrunProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub image: Option<&'a ImageBytes>,
    pub temperature: f64,
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub latency_ms: u64,
}

/// A vision-language backend. One blocking call per request, no retries.
pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn VisionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: VisionProvider + 'static>(&mut self, provider: P) {
        self.register_shared(Arc::new(provider));
    }

    pub fn register_shared(&mut self, provider: Arc<dyn VisionProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VisionProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn bind(&self, provider: &str, model: &str) -> Result<ModelHandle> {
        let Some(found) = self.get(provider) else {
            bail!(
                "unknown provider '{provider}' (available: {})",
                self.names().join(", ")
            );
        };
        Ok(ModelHandle::new(found, model))
    }
}

pub fn default_provider_registry() -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(OpenAiProvider::new());
    providers.register(AnthropicProvider::new());
    providers.register(GeminiProvider::new());
    providers.register(OllamaProvider::new());
    providers
}

/// A provider paired with the model it should be asked for.
#[derive(Clone)]
pub struct ModelHandle {
    provider: Arc<dyn VisionProvider>,
    model: String,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(provider: Arc<dyn VisionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `provider/model`, the name recorded on judge scores.
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider.name(), self.model)
    }

    pub fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        image: Option<&ImageBytes>,
        temperature: f64,
        max_tokens: u64,
    ) -> Result<ProviderResponse> {
        let request = GenerateRequest {
            model: &self.model,
            system_prompt,
            user_prompt,
            image,
            temperature,
            max_tokens,
        };
        self.provider
            .generate(&request)
            .with_context(|| format!("{} call failed", self.label()))
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn usage_count(payload: &Value, pointer: &str) -> Option<u64> {
    payload.pointer(pointer).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_binds_known_providers_only() -> Result<()> {
        let registry = default_provider_registry();
        assert_eq!(
            registry.names(),
            vec!["anthropic", "dryrun", "gemini", "ollama", "openai"]
        );
        let handle = registry.bind("dryrun", "dryrun-vision-1")?;
        assert_eq!(handle.label(), "dryrun/dryrun-vision-1");

        let err = registry.bind("nope", "x").err().map(|err| err.to_string());
        assert!(err.unwrap_or_default().contains("available: anthropic"));
        Ok(())
    }

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    #[test]
    fn usage_count_reads_nested_numbers() {
        let payload = serde_json::json!({"usage": {"prompt_tokens": 12}});
        assert_eq!(usage_count(&payload, "/usage/prompt_tokens"), Some(12));
        assert_eq!(usage_count(&payload, "/usage/completion_tokens"), None);
    }
}
