//! Resolution of the three seed texts (profile, style, initial state).
//!
//! Strategies are tried in order and the first one that applies wins:
//! inline text, explicit reference, frozen file, on-demand generation.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gallery_contracts::events::EventWriter;
use gallery_contracts::experiment::{
    split_reference, ArtifactKind, ArtifactProvenance, Artifacts, GenerationPrompts, PromptVariant,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::json;

use crate::map_object;
use crate::parametric::parametric_variants;
use crate::providers::ModelHandle;

pub const GENERATION_MAX_TOKENS: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{kind} reference file not found: {path}")]
    MissingReference { kind: ArtifactKind, path: PathBuf },
    #[error("variant '{variant_id}' not found in {path} (available: {})", available.join(", "))]
    VariantNotFound {
        path: PathBuf,
        variant_id: String,
        available: Vec<String>,
    },
    #[error("results file has no results: {0}")]
    EmptyResults(PathBuf),
    #[error("invalid results file {path}")]
    InvalidResults {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("frozen artifacts directory not found: {0}")]
    FrozenDirMissing(PathBuf),
    #[error("cannot generate {kind}: generation template {path} not found")]
    MissingGenerationTemplate { kind: ArtifactKind, path: PathBuf },
    #[error("cannot generate {kind}: {path} has neither _base_user_prompt nor variants")]
    EmptyGenerationTemplate { kind: ArtifactKind, path: PathBuf },
    #[error("no strategy could resolve the {0}")]
    NoStrategy(ArtifactKind),
}

/// What the caller knows about one artifact before resolution.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactRequest<'a> {
    pub kind: ArtifactKind,
    pub inline: Option<&'a str>,
    /// Where inline text came from, kept in provenance.
    pub inline_origin: Option<&'a str>,
    /// `results.json[:variant]` or a plain text file.
    pub reference: Option<&'a str>,
}

impl<'a> ArtifactRequest<'a> {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            inline: None,
            inline_origin: None,
            reference: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArtifact {
    pub text: String,
    pub provenance: ArtifactProvenance,
}

impl ResolvedArtifact {
    fn new(kind: ArtifactKind, text: String, strategy: &str, source: Option<String>) -> Self {
        Self {
            text,
            provenance: ArtifactProvenance {
                kind,
                strategy: strategy.to_string(),
                source,
            },
        }
    }
}

/// One way of producing an artifact. `Ok(None)` means "not applicable here".
pub trait ArtifactStrategy {
    fn name(&self) -> &'static str;
    fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<Option<ResolvedArtifact>>;
}

pub struct InlineStrategy;

impl ArtifactStrategy for InlineStrategy {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<Option<ResolvedArtifact>> {
        let Some(text) = request.inline.filter(|text| !text.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ResolvedArtifact::new(
            request.kind,
            text.to_string(),
            self.name(),
            request.inline_origin.map(str::to_string),
        )))
    }
}

#[derive(Debug, Deserialize)]
struct StoredResponse {
    prompt_variant_id: String,
    raw_response: String,
}

pub struct ReferenceStrategy;

impl ReferenceStrategy {
    fn from_results(
        kind: ArtifactKind,
        path: &Path,
        variant_id: Option<&str>,
    ) -> Result<String, ResolveError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ResolveError::MissingReference {
            kind,
            path: path.to_path_buf(),
        })?;
        let rows: Vec<StoredResponse> =
            serde_json::from_str(&raw).map_err(|source| ResolveError::InvalidResults {
                path: path.to_path_buf(),
                source,
            })?;
        let found = match variant_id {
            Some(variant_id) => rows
                .iter()
                .find(|row| row.prompt_variant_id == variant_id)
                .ok_or_else(|| {
                    let mut available: Vec<String> =
                        rows.iter().map(|row| row.prompt_variant_id.clone()).collect();
                    available.sort();
                    available.dedup();
                    ResolveError::VariantNotFound {
                        path: path.to_path_buf(),
                        variant_id: variant_id.to_string(),
                        available,
                    }
                })?,
            None => rows
                .first()
                .ok_or_else(|| ResolveError::EmptyResults(path.to_path_buf()))?,
        };
        Ok(found.raw_response.trim().to_string())
    }
}

impl ArtifactStrategy for ReferenceStrategy {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<Option<ResolvedArtifact>> {
        let Some(reference) = request.reference.filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };
        let (path_part, variant_id) = split_reference(reference);
        let path = Path::new(path_part);
        if !path.is_file() {
            return Err(ResolveError::MissingReference {
                kind: request.kind,
                path: path.to_path_buf(),
            }
            .into());
        }
        let text = if path_part.ends_with(".json") {
            Self::from_results(request.kind, path, variant_id)?
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?
                .trim()
                .to_string()
        };
        Ok(Some(ResolvedArtifact::new(
            request.kind,
            text,
            self.name(),
            Some(reference.to_string()),
        )))
    }
}

/// Reads `<dir>/<kind>.txt` from a frozen artifacts directory.
pub struct FrozenStrategy {
    dir: Option<PathBuf>,
    explicit: bool,
}

impl FrozenStrategy {
    /// `explicit` marks a directory named in config, which must then exist.
    pub fn new(dir: Option<(PathBuf, bool)>) -> Self {
        match dir {
            Some((dir, explicit)) => Self {
                dir: Some(dir),
                explicit,
            },
            None => Self {
                dir: None,
                explicit: false,
            },
        }
    }
}

impl ArtifactStrategy for FrozenStrategy {
    fn name(&self) -> &'static str {
        "frozen"
    }

    fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<Option<ResolvedArtifact>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        if !dir.is_dir() {
            if self.explicit {
                return Err(ResolveError::FrozenDirMissing(dir.clone()).into());
            }
            return Ok(None);
        }
        let path = dir.join(request.kind.file_name());
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .trim()
            .to_string();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResolvedArtifact::new(
            request.kind,
            text,
            self.name(),
            Some(path.display().to_string()),
        )))
    }
}

/// Asks the generation model for a fresh artifact, one text-only call.
pub struct GenerateStrategy {
    model: ModelHandle,
    experiments_dir: PathBuf,
    temperature: f64,
    parametric: bool,
    rng: RefCell<StdRng>,
}

impl GenerateStrategy {
    pub fn new(
        model: ModelHandle,
        experiments_dir: impl Into<PathBuf>,
        temperature: f64,
        parametric: bool,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            model,
            experiments_dir: experiments_dir.into(),
            temperature,
            parametric,
            rng: RefCell::new(rng),
        }
    }

    fn template_path(&self, kind: ArtifactKind) -> PathBuf {
        self.experiments_dir
            .join(kind.generation_experiment())
            .join("prompts.json")
    }

    fn load_prompts(&self, kind: ArtifactKind) -> Result<GenerationPrompts> {
        let path = self.template_path(kind);
        if !path.is_file() {
            return Err(ResolveError::MissingGenerationTemplate { kind, path }.into());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    }

    fn pick_variant(&self, kind: ArtifactKind, prompts: &GenerationPrompts) -> Result<PromptVariant> {
        let mut rng = self
            .rng
            .try_borrow_mut()
            .context("generation rng already in use")?;
        if self.parametric && !prompts.base_user_prompt.trim().is_empty() {
            let mut variants = parametric_variants(kind, prompts, 1, &mut *rng)?;
            if let Some(variant) = variants.pop() {
                return Ok(variant);
            }
        }
        let Some(variant) = prompts.variants.choose(&mut *rng) else {
            return Err(ResolveError::EmptyGenerationTemplate {
                kind,
                path: self.template_path(kind),
            }
            .into());
        };
        let system_prompt = if variant.system_prompt.trim().is_empty() {
            prompts.system_prompt.trim().to_string()
        } else {
            variant.system_prompt.trim().to_string()
        };
        Ok(PromptVariant {
            system_prompt,
            user_prompt: variant.user_prompt.trim().to_string(),
            ..variant.clone()
        })
    }
}

impl ArtifactStrategy for GenerateStrategy {
    fn name(&self) -> &'static str {
        "generated"
    }

    fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<Option<ResolvedArtifact>> {
        let prompts = self.load_prompts(request.kind)?;
        let variant = self.pick_variant(request.kind, &prompts)?;
        let response = self.model.generate(
            &variant.system_prompt,
            &variant.user_prompt,
            None,
            self.temperature,
            GENERATION_MAX_TOKENS,
        )?;
        Ok(Some(ResolvedArtifact::new(
            request.kind,
            response.content.trim().to_string(),
            self.name(),
            Some(format!(
                "{}:{} ({})",
                request.kind.generation_experiment(),
                variant.id,
                self.model.label()
            )),
        )))
    }
}

pub struct ArtifactResolver {
    strategies: Vec<Box<dyn ArtifactStrategy>>,
    events: EventWriter,
}

impl ArtifactResolver {
    pub fn new(events: EventWriter) -> Self {
        Self {
            strategies: Vec::new(),
            events,
        }
    }

    /// inline, reference, frozen, then generation when a generator is given.
    pub fn standard(
        events: EventWriter,
        frozen_dir: Option<(PathBuf, bool)>,
        generator: Option<GenerateStrategy>,
    ) -> Self {
        let mut resolver = Self::new(events)
            .with_strategy(InlineStrategy)
            .with_strategy(ReferenceStrategy)
            .with_strategy(FrozenStrategy::new(frozen_dir));
        if let Some(generator) = generator {
            resolver = resolver.with_strategy(generator);
        }
        resolver
    }

    pub fn with_strategy<S: ArtifactStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn resolve(&self, request: &ArtifactRequest<'_>) -> Result<ResolvedArtifact> {
        for strategy in &self.strategies {
            let Some(resolved) = strategy
                .resolve(request)
                .with_context(|| format!("{} strategy failed for {}", strategy.name(), request.kind))?
            else {
                continue;
            };
            self.events.emit(
                "artifact_resolved",
                map_object(json!({
                    "kind": request.kind.as_str(),
                    "strategy": strategy.name(),
                    "source": resolved.provenance.source,
                    "chars": resolved.text.chars().count(),
                })),
            )?;
            return Ok(resolved);
        }
        Err(ResolveError::NoStrategy(request.kind).into())
    }

    /// Resolves all three artifacts; any failure aborts before a walk starts.
    pub fn resolve_all(&self, requests: &[ArtifactRequest<'_>]) -> Result<Artifacts> {
        let mut artifacts = Artifacts::default();
        for kind in ArtifactKind::ALL {
            let fallback = ArtifactRequest::new(kind);
            let request = requests
                .iter()
                .find(|request| request.kind == kind)
                .unwrap_or(&fallback);
            let resolved = self.resolve(request)?;
            artifacts.set(kind, resolved.text);
            artifacts.provenance.push(resolved.provenance);
        }
        Ok(artifacts)
    }
}
