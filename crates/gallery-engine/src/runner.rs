//! End-to-end orchestration: resolve artifacts, walk, judge, summarize.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use gallery_contracts::events::EventWriter;
use gallery_contracts::experiment::{
    ArtifactKind, Artifacts, ExperimentConfig, ExperimentDefinition, PromptVariant,
};
use gallery_contracts::models::{ModelSelection, ModelSelector, VISION};
use gallery_contracts::runs::{
    aggregate, list_run_dirs, write_summary, ExperimentSummary, FsRunStore, PromptFidelity,
    RunKey, RunManifest, RunScores, RunStore, RunStoreExt,
};
use serde::Serialize;
use serde_json::json;

use crate::artifacts::{ArtifactRequest, ArtifactResolver, GenerateStrategy};
use crate::images::{ImageCache, SourceImageLoader};
use crate::judge::JudgeEvaluator;
use crate::map_object;
use crate::providers::{default_provider_registry, ModelHandle, ProviderRegistry};
use crate::reconstruct::PromptReconstructor;
use crate::walk::{GalleryWalk, WalkOutcome, WalkSettings};

pub const EVENTS_FILE: &str = "events.jsonl";

/// Caller-supplied text or reference for one artifact, overriding config.
#[derive(Debug, Clone, Default)]
pub struct ArtifactOverride {
    pub text: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub experiment_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Directory holding `<kind>_generation/` templates; defaults to the
    /// experiment directory's parent.
    pub experiments_root: Option<PathBuf>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Restricts the walk to these variant ids, in this order.
    pub variant_ids: Vec<String>,
    pub profile: ArtifactOverride,
    pub style: ArtifactOverride,
    pub initial_state: ArtifactOverride,
    pub reuse_artifacts: Option<PathBuf>,
    /// Generate missing artifacts from parametric hints rather than fixed variants.
    pub parametric: bool,
    pub seed: Option<u64>,
    pub argv: Vec<String>,
}

impl WalkOptions {
    fn artifact_override(&self, kind: ArtifactKind) -> &ArtifactOverride {
        match kind {
            ArtifactKind::Profile => &self.profile,
            ArtifactKind::Style => &self.style,
            ArtifactKind::InitialState => &self.initial_state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkRun {
    pub run_dir: PathBuf,
    pub model: String,
    pub fallback_reason: Option<String>,
    pub artifacts: Artifacts,
    pub outcomes: Vec<WalkOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct JudgeOptions {
    /// Where `criteria.json` and the images live.
    pub experiment_dir: PathBuf,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub judge_model: String,
    pub fidelity: PromptFidelity,
    pub scores: usize,
    pub unparsed: usize,
}

pub struct GalleryRunner {
    providers: ProviderRegistry,
    selector: ModelSelector,
}

impl Default for GalleryRunner {
    fn default() -> Self {
        Self::new(default_provider_registry(), ModelSelector::new(None))
    }
}

impl GalleryRunner {
    pub fn new(providers: ProviderRegistry, selector: ModelSelector) -> Self {
        Self {
            providers,
            selector,
        }
    }

    fn select_model(
        &self,
        provider: &str,
        requested: Option<&str>,
    ) -> Result<(ModelHandle, ModelSelection)> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let selection = self
            .selector
            .select(provider, requested, VISION)
            .map_err(|reason| anyhow!(reason))?;
        let handle = self.providers.bind(provider, &selection.model.name)?;
        Ok((handle, selection))
    }

    /// Runs every selected variant over the experiment's images in a fresh run directory.
    pub fn walk(&self, options: &WalkOptions) -> Result<WalkRun> {
        let definition = ExperimentDefinition::load(&options.experiment_dir).with_context(|| {
            format!(
                "failed to load experiment {}",
                options.experiment_dir.display()
            )
        })?;
        let variants = select_variants(&definition, &options.variant_ids)?;

        let provider = options
            .provider
            .clone()
            .unwrap_or_else(|| definition.config.provider.clone());
        let requested = options
            .model
            .as_deref()
            .or(Some(definition.config.model.as_str()));
        let (model, selection) = self.select_model(&provider, requested)?;

        let mut config = definition.config.clone();
        config.provider = provider.clone();
        config.model = selection.model.name.clone();

        // Artifacts resolve before the run directory is created; their
        // events are replayed into the run log once it exists.
        let preflight = EventWriter::in_memory(config.experiment_id.clone());
        let artifacts = self.resolve_artifacts(&definition, options, &model, &preflight)?;

        let store = FsRunStore::create(&options.output_dir, &config.experiment_id)?;
        let events = EventWriter::new(store.root().join(EVENTS_FILE), store.run_name());
        events.emit(
            "run_started",
            map_object(json!({
                "experiment_id": config.experiment_id,
                "out_dir": store.location(),
                "provider": provider,
                "model": config.model,
                "fallback_reason": selection.fallback_reason,
                "variants": variants.iter().map(|variant| variant.id.as_str()).collect::<Vec<_>>(),
                "images": config.images.len(),
            })),
        )?;
        for event in preflight.events() {
            if let Some(payload) = event.as_object() {
                let mut payload = payload.clone();
                payload.remove("type");
                payload.remove("run_id");
                events.emit("artifact_resolved", payload)?;
            }
        }

        store.put(RunKey::Config, &config)?;
        store.put(RunKey::Variants, &variants)?;
        store.put(RunKey::Artifacts, &artifacts)?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        store.put(
            RunKey::Manifest,
            &RunManifest::capture(options.argv.clone(), &cwd),
        )?;

        let mut cache = image_cache(&definition.root);
        let settings = WalkSettings {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };
        let outcomes = GalleryWalk::new(&model, &store, &events, settings).run_all(
            &variants,
            &artifacts,
            &config.images,
            &mut cache,
        )?;

        events.emit(
            "run_finished",
            map_object(json!({
                "results": outcomes.iter().map(|outcome| outcome.steps.len()).sum::<usize>(),
                "carried_forward": outcomes.iter().map(WalkOutcome::carried_forward).sum::<usize>(),
            })),
        )?;
        Ok(WalkRun {
            run_dir: store.root().to_path_buf(),
            model: model.label(),
            fallback_reason: selection.fallback_reason,
            artifacts,
            outcomes,
        })
    }

    fn resolve_artifacts(
        &self,
        definition: &ExperimentDefinition,
        options: &WalkOptions,
        model: &ModelHandle,
        events: &EventWriter,
    ) -> Result<Artifacts> {
        let reused = match &options.reuse_artifacts {
            Some(run_dir) => {
                let store = FsRunStore::open(run_dir)?;
                let Some(artifacts) = store.load_artifacts()? else {
                    bail!("no {} in {}", RunKey::Artifacts.file_name(), run_dir.display());
                };
                Some((artifacts, format!("reused:{}", run_dir.display())))
            }
            None => None,
        };

        let references: Vec<Option<String>> = ArtifactKind::ALL
            .iter()
            .map(|kind| {
                options
                    .artifact_override(*kind)
                    .reference
                    .clone()
                    .or_else(|| definition.artifact_reference(*kind))
            })
            .collect();

        let requests: Vec<ArtifactRequest<'_>> = ArtifactKind::ALL
            .iter()
            .zip(&references)
            .map(|(kind, reference)| {
                let explicit = options.artifact_override(*kind).text.as_deref();
                let (inline, inline_origin) = match (&reused, explicit) {
                    (_, Some(text)) => (Some(text), Some("command line")),
                    (Some((artifacts, origin)), None) => {
                        (Some(artifacts.get(*kind)), Some(origin.as_str()))
                    }
                    (None, None) => (None, None),
                };
                ArtifactRequest {
                    kind: *kind,
                    inline,
                    inline_origin,
                    reference: reference.as_deref(),
                }
            })
            .collect();

        let experiments_root = options.experiments_root.clone().unwrap_or_else(|| {
            definition
                .root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let generator = GenerateStrategy::new(
            model.clone(),
            experiments_root,
            definition.config.temperature,
            options.parametric,
            options.seed,
        );
        ArtifactResolver::standard(events.clone(), definition.frozen_dir(), Some(generator))
            .resolve_all(&requests)
    }

    /// Judges a stored run and appends the scores to it.
    pub fn evaluate(&self, run_dir: &Path, options: &JudgeOptions) -> Result<EvaluationReport> {
        let store = FsRunStore::open(run_dir)?;
        let record = store.load_record()?;
        if record.results.is_empty() {
            bail!("run has no results to evaluate: {}", run_dir.display());
        }
        let definition = ExperimentDefinition::load(&options.experiment_dir).with_context(|| {
            format!(
                "failed to load experiment {}",
                options.experiment_dir.display()
            )
        })?;
        if definition.criteria.is_empty() {
            bail!(
                "no criteria defined in {}",
                definition.root.join("criteria.json").display()
            );
        }

        let provider = options
            .provider
            .clone()
            .unwrap_or_else(|| record.config.provider.clone());
        let requested = options
            .model
            .as_deref()
            .or(Some(record.config.model.as_str()));
        let (judge, _) = self.select_model(&provider, requested)?;

        let events = EventWriter::new(store.root().join(EVENTS_FILE), store.run_name());
        let contexts = PromptReconstructor::standard(events.clone()).reconstruct(&record)?;
        let mut cache = image_cache(&definition.root);
        let evaluation = JudgeEvaluator::new(&judge, &events).evaluate(
            &record.results,
            &contexts,
            &definition.criteria,
            &record.config.images,
            &mut cache,
        )?;
        store.append_scores(&evaluation.scores, &evaluation.judge_prompts)?;

        Ok(EvaluationReport {
            judge_model: judge.label(),
            fidelity: contexts.fidelity,
            scores: evaluation.scores.len(),
            unparsed: evaluation.unparsed(),
        })
    }
}

fn image_cache(root: &Path) -> ImageCache {
    ImageCache::new(Box::new(SourceImageLoader::new(Some(root.to_path_buf()))))
}

fn select_variants(
    definition: &ExperimentDefinition,
    variant_ids: &[String],
) -> Result<Vec<PromptVariant>> {
    if variant_ids.is_empty() {
        return Ok(definition.variants.clone());
    }
    variant_ids
        .iter()
        .map(|variant_id| {
            definition.variant(variant_id).cloned().ok_or_else(|| {
                let available: Vec<&str> = definition
                    .variants
                    .iter()
                    .map(|variant| variant.id.as_str())
                    .collect();
                anyhow!(
                    "unknown variant '{variant_id}' (available: {})",
                    available.join(", ")
                )
            })
        })
        .collect()
}

fn run_scores(store: &FsRunStore) -> Result<(RunScores, ExperimentConfig)> {
    let Some(config) = store.load_config()? else {
        bail!("run has no {}: {}", RunKey::Config.file_name(), store.location());
    };
    Ok((
        RunScores {
            run: store.run_name(),
            provider: config.provider.clone(),
            model: config.model.clone(),
            results: store.load_results()?,
            scores: store.load_scores()?,
        },
        config,
    ))
}

/// Summarizes one run, written into that run's directory.
pub fn summarize_run(run_dir: &Path, judge_model: Option<&str>) -> Result<ExperimentSummary> {
    let store = FsRunStore::open(run_dir)?;
    let (scores, config) = run_scores(&store)?;
    let summary = aggregate(&config.experiment_id, &[scores], judge_model);
    let path = store.path_for(RunKey::Summary);
    write_summary(&path, &summary)?;
    EventWriter::new(store.root().join(EVENTS_FILE), store.run_name()).emit(
        "summary_written",
        map_object(json!({
            "summary_path": path.to_string_lossy().to_string(),
            "runs": 1,
        })),
    )?;
    Ok(summary)
}

/// Summarizes every run of an experiment into `<output>/<experiment>/summary.json`.
pub fn summarize_experiment(
    output_dir: &Path,
    experiment_id: &str,
    judge_model: Option<&str>,
) -> Result<ExperimentSummary> {
    let dirs = list_run_dirs(output_dir, experiment_id)?;
    if dirs.is_empty() {
        bail!(
            "no runs with results under {}",
            output_dir.join(experiment_id).display()
        );
    }
    let runs = dirs
        .iter()
        .map(|dir| FsRunStore::open(dir).and_then(|store| run_scores(&store)))
        .map(|loaded| loaded.map(|(scores, _)| scores))
        .collect::<Result<Vec<_>>>()?;
    let summary = aggregate(experiment_id, &runs, judge_model);
    let parent = output_dir.join(experiment_id);
    let path = parent.join(RunKey::Summary.file_name());
    write_summary(&path, &summary)?;
    EventWriter::new(parent.join(EVENTS_FILE), experiment_id).emit(
        "summary_written",
        map_object(json!({
            "summary_path": path.to_string_lossy().to_string(),
            "runs": runs.len(),
        })),
    )?;
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FreezeProvenance {
    description: String,
    frozen_at: String,
    sources: BTreeMap<String, String>,
}

/// Copies a run's artifacts into `<experiment>/artifacts/` so later walks
/// reuse them. Existing frozen text files are kept unless `force` is set.
pub fn freeze_artifacts(
    run_dir: &Path,
    experiment_dir: &Path,
    description: Option<&str>,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let store = FsRunStore::open(run_dir)?;
    let Some(artifacts) = store.load_artifacts()? else {
        bail!("no {} in {}", RunKey::Artifacts.file_name(), run_dir.display());
    };
    if !experiment_dir.is_dir() {
        bail!("experiment directory not found: {}", experiment_dir.display());
    }
    let target = experiment_dir.join("artifacts");
    if !force && target.is_dir() {
        let existing = ArtifactKind::ALL
            .iter()
            .any(|kind| target.join(kind.file_name()).exists());
        if existing {
            bail!(
                "{} already holds frozen artifacts; pass --force to overwrite",
                target.display()
            );
        }
    }
    std::fs::create_dir_all(&target)
        .with_context(|| format!("failed to create {}", target.display()))?;

    let source = store.path_for(RunKey::Artifacts).display().to_string();
    let mut written = Vec::new();
    let mut sources = BTreeMap::new();
    for kind in ArtifactKind::ALL {
        let path = target.join(kind.file_name());
        std::fs::write(&path, artifacts.get(kind))
            .with_context(|| format!("failed to write {}", path.display()))?;
        sources.insert(kind.as_str().to_string(), source.clone());
        written.push(path);
    }

    let experiment_name = experiment_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let provenance = FreezeProvenance {
        description: description
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("Frozen artifacts for {experiment_name}")),
        frozen_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        sources,
    };
    let provenance_path = experiment_dir.join("provenance.json");
    std::fs::write(
        &provenance_path,
        serde_json::to_string_pretty(&provenance)?,
    )
    .with_context(|| format!("failed to write {}", provenance_path.display()))?;
    written.push(provenance_path);
    Ok(written)
}
