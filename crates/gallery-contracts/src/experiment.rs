//! Experiment definitions: the static inputs of a run.
//!
//! An experiment directory holds `config.json`, `prompts.json` and
//! `criteria.json`, plus an optional frozen `artifacts/` directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VARIANT_ID: &str = "reflection";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("experiment directory not found: {0}")]
    MissingExperiment(PathBuf),
    #[error("required experiment file not found: {0}")]
    MissingFile(PathBuf),
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no prompt variants defined in {0}")]
    NoVariants(PathBuf),
    #[error("duplicate image id '{0}' in experiment config")]
    DuplicateImageId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Profile,
    Style,
    InitialState,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Profile,
        ArtifactKind::Style,
        ArtifactKind::InitialState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Profile => "profile",
            ArtifactKind::Style => "style",
            ArtifactKind::InitialState => "initial_state",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Profile => "Profile",
            ArtifactKind::Style => "Style",
            ArtifactKind::InitialState => "Initial state",
        }
    }

    /// Name of the experiment whose templates generate this artifact.
    pub fn generation_experiment(self) -> &'static str {
        match self {
            ArtifactKind::Profile => "profile_generation",
            ArtifactKind::Style => "style_generation",
            ArtifactKind::InitialState => "initial_state_generation",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Profile => "profile.txt",
            ArtifactKind::Style => "style.txt",
            ArtifactKind::InitialState => "initial_state.txt",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub images: Vec<ImageInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
}

impl ExperimentConfig {
    pub fn new(experiment_id: impl Into<String>, provider: &str, model: &str) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            provider: provider.to_string(),
            model: model.to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            images: Vec::new(),
            artifacts_dir: None,
            profile: None,
            style: None,
            initial_state: None,
        }
    }

    pub fn image(&self, image_id: &str) -> Option<&ImageInput> {
        self.images.iter().find(|image| image.id == image_id)
    }

    pub fn image_position(&self, image_id: &str) -> Option<usize> {
        self.images.iter().position(|image| image.id == image_id)
    }

    pub fn artifact_reference(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Profile => self.profile.as_deref(),
            ArtifactKind::Style => self.style.as_deref(),
            ArtifactKind::InitialState => self.initial_state.as_deref(),
        }
        .filter(|value| !value.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for image in &self.images {
            if !seen.insert(image.id.as_str()) {
                return Err(ConfigError::DuplicateImageId(image.id.clone()));
            }
        }
        Ok(())
    }
}

/// A named (system prompt, user prompt template) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    pub description: String,
    pub scoring_prompt: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_image: bool,
}

/// The three seed texts of a walk plus where each one came from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Artifacts {
    pub profile: String,
    pub style: String,
    pub initial_state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<ArtifactProvenance>,
}

impl Artifacts {
    pub fn get(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Profile => &self.profile,
            ArtifactKind::Style => &self.style,
            ArtifactKind::InitialState => &self.initial_state,
        }
    }

    pub fn set(&mut self, kind: ArtifactKind, text: String) {
        match kind {
            ArtifactKind::Profile => self.profile = text,
            ArtifactKind::Style => self.style = text,
            ArtifactKind::InitialState => self.initial_state = text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactProvenance {
    pub kind: ArtifactKind,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Templates used to generate an artifact on demand.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GenerationPrompts {
    #[serde(default, rename = "_system_prompt")]
    pub system_prompt: String,
    #[serde(default, rename = "_base_user_prompt")]
    pub base_user_prompt: String,
    #[serde(default)]
    pub variants: Vec<PromptVariant>,
}

#[derive(Debug, Deserialize)]
struct PromptsFile {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    user_prompt_template: Option<String>,
    #[serde(default)]
    variants: Vec<PromptVariant>,
}

#[derive(Debug, Deserialize)]
struct CriteriaFile {
    #[serde(default)]
    criteria: Vec<Criterion>,
}

#[derive(Debug, Clone)]
pub struct ExperimentDefinition {
    pub root: PathBuf,
    pub config: ExperimentConfig,
    pub variants: Vec<PromptVariant>,
    pub criteria: Vec<Criterion>,
}

impl ExperimentDefinition {
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ConfigError::MissingExperiment(root));
        }

        let config: ExperimentConfig = read_required(&root.join("config.json"))?;
        config.validate()?;

        let prompts_path = root.join("prompts.json");
        let prompts: PromptsFile = read_required(&prompts_path)?;
        let variants = variants_from_prompts(prompts);
        if variants.is_empty() {
            return Err(ConfigError::NoVariants(prompts_path));
        }

        let criteria_path = root.join("criteria.json");
        let criteria = if criteria_path.is_file() {
            read_required::<CriteriaFile>(&criteria_path)?
                .criteria
                .into_iter()
                .map(trim_criterion)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            root,
            config,
            variants,
            criteria,
        })
    }

    /// Directory holding frozen artifacts, and whether it was named explicitly.
    pub fn frozen_dir(&self) -> Option<(PathBuf, bool)> {
        if let Some(dir) = self
            .config
            .artifacts_dir
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            return Some((self.root.join(dir), true));
        }
        let implicit = self.root.join("artifacts");
        implicit.is_dir().then_some((implicit, false))
    }

    /// Artifact reference from config, resolved against the experiment root.
    pub fn artifact_reference(&self, kind: ArtifactKind) -> Option<String> {
        let raw = self.config.artifact_reference(kind)?;
        let (path_part, variant) = split_reference(raw);
        let joined = self.root.join(path_part);
        Some(match variant {
            Some(variant) => format!("{}:{variant}", joined.display()),
            None => joined.display().to_string(),
        })
    }

    pub fn variant(&self, variant_id: &str) -> Option<&PromptVariant> {
        self.variants.iter().find(|variant| variant.id == variant_id)
    }
}

/// Splits `path.json:variant` into its parts. Anything not ending in `.json`
/// before the last colon is treated as a plain path.
pub fn split_reference(raw: &str) -> (&str, Option<&str>) {
    if let Some((path, variant)) = raw.rsplit_once(':') {
        if path.ends_with(".json") && !variant.is_empty() {
            return (path, Some(variant));
        }
    }
    (raw, None)
}

fn variants_from_prompts(prompts: PromptsFile) -> Vec<PromptVariant> {
    if !prompts.variants.is_empty() {
        return prompts
            .variants
            .into_iter()
            .map(|variant| PromptVariant {
                system_prompt: variant.system_prompt.trim().to_string(),
                user_prompt: variant.user_prompt.trim().to_string(),
                ..variant
            })
            .collect();
    }
    match prompts.user_prompt_template {
        Some(template) if !template.trim().is_empty() => vec![PromptVariant {
            id: DEFAULT_VARIANT_ID.to_string(),
            name: "Stateful reflection".to_string(),
            system_prompt: prompts
                .system_prompt
                .unwrap_or_default()
                .trim()
                .to_string(),
            user_prompt: template.trim().to_string(),
        }],
        _ => Vec::new(),
    }
}

fn trim_criterion(criterion: Criterion) -> Criterion {
    Criterion {
        description: criterion.description.trim().to_string(),
        scoring_prompt: criterion.scoring_prompt.trim().to_string(),
        ..criterion
    }
}

fn read_required<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u64 {
    2048
}
