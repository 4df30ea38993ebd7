use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Picks a model for `provider`.
    ///
    /// A requested name the registry does not know is passed through unchanged,
    /// since providers ship models faster than the table is updated. A known
    /// model that lacks the capability, or belongs to another provider, falls
    /// back to the provider default with a reason.
    pub fn select(
        &self,
        provider: &str,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let fallback_reason = match requested {
            Some(requested_value) => match self.registry.get(requested_value) {
                None => {
                    return Ok(ModelSelection {
                        model: ModelSpec {
                            name: requested_value.to_string(),
                            provider: provider.to_string(),
                            capabilities: vec![capability.to_string()],
                            context_window: None,
                        },
                        requested: Some(requested_value.to_string()),
                        fallback_reason: None,
                    });
                }
                Some(model) if model.provider == provider && model.supports(capability) => {
                    return Ok(ModelSelection {
                        model: model.clone(),
                        requested: Some(requested_value.to_string()),
                        fallback_reason: None,
                    });
                }
                Some(model) if model.provider != provider => format!(
                    "Requested model '{requested_value}' belongs to provider '{}', not '{provider}'.",
                    model.provider
                ),
                Some(_) => format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                ),
            },
            None => "No model specified; using default.".to_string(),
        };

        let candidates = self.registry.for_provider(provider, capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for provider '{provider}' with capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TEXT, VISION};

    #[test]
    fn default_is_used_when_nothing_requested() {
        let selector = ModelSelector::new(None);
        let selection = selector.select("anthropic", None, VISION);
        let selection = selection.unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "claude-opus-4-6");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn unknown_models_pass_through() {
        let selector = ModelSelector::new(None);
        let selection = selector
            .select("openai", Some("gpt-9-preview"), VISION)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "gpt-9-preview");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn incapable_or_foreign_models_fall_back() {
        let selector = ModelSelector::new(None);
        let selection = selector
            .select("ollama", Some("llama3.1:8b"), VISION)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "llava:7b");
        assert!(selection.fallback_reason.is_some());

        let selection = selector
            .select("gemini", Some("gpt-5.2"), TEXT)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "gemini-2.5-pro-preview-05-06");
    }

    #[test]
    fn unknown_provider_without_request_is_an_error() {
        let selector = ModelSelector::new(None);
        assert!(selector.select("mystery", None, TEXT).is_err());
    }
}
