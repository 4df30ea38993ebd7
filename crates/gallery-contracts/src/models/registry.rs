use indexmap::IndexMap;

pub const TEXT: &str = "text";
pub const VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known models in preference order; the first entry per provider is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn for_provider(&self, provider: &str, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider && model.supports(capability))
            .cloned()
            .collect()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert("dryrun-vision-1", "dryrun", &[TEXT, VISION], Some(8192));
    insert("gpt-5.2", "openai", &[TEXT, VISION], Some(128000));
    insert("gpt-4o", "openai", &[TEXT, VISION], Some(128000));
    insert("gpt-4o-mini", "openai", &[TEXT, VISION], Some(128000));
    insert("claude-opus-4-6", "anthropic", &[TEXT, VISION], Some(200000));
    insert("claude-sonnet-4-5", "anthropic", &[TEXT, VISION], Some(200000));
    insert(
        "gemini-2.5-pro-preview-05-06",
        "gemini",
        &[TEXT, VISION],
        Some(1048576),
    );
    insert("gemini-2.5-flash", "gemini", &[TEXT, VISION], Some(1048576));
    insert("llava:7b", "ollama", &[TEXT, VISION], Some(4096));
    insert("llama3.1:8b", "ollama", &[TEXT], Some(131072));

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults_come_first() {
        let registry = ModelRegistry::new(None);
        let openai = registry.for_provider("openai", VISION);
        assert_eq!(openai.first().map(|m| m.name.as_str()), Some("gpt-5.2"));
        let ollama = registry.for_provider("ollama", VISION);
        assert_eq!(ollama.len(), 1);
        assert_eq!(ollama[0].name, "llava:7b");
    }

    #[test]
    fn capability_lookup_is_per_model() {
        let registry = ModelRegistry::new(None);
        let text_only = registry.get("llama3.1:8b");
        assert!(text_only.is_some_and(|model| model.supports(TEXT)));
        assert!(text_only.is_some_and(|model| !model.supports(VISION)));
        assert!(registry.get("nope").is_none());
    }
}
