use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::records::{AssembledPrompt, JudgePromptRecord, RunResult, Score};
use crate::experiment::{Artifacts, ExperimentConfig, PromptVariant};

/// Logical records kept for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunKey {
    Config,
    Variants,
    Artifacts,
    Results,
    AssembledPrompts,
    Scores,
    JudgePrompts,
    Summary,
    Manifest,
}

impl RunKey {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Config => "config.json",
            Self::Variants => "prompts.json",
            Self::Artifacts => "artifacts.json",
            Self::Results => "results.json",
            Self::AssembledPrompts => "assembled_prompts.json",
            Self::Scores => "scores.json",
            Self::JudgePrompts => "judge_prompts.json",
            Self::Summary => "summary.json",
            Self::Manifest => "run_manifest.json",
        }
    }
}

/// Keyed JSON persistence for one run.
pub trait RunStore {
    /// Human-readable location used in logs and errors.
    fn location(&self) -> String;

    /// Short name of the run, e.g. the timestamped directory name.
    fn run_name(&self) -> String;

    fn put_value(&self, key: RunKey, value: &Value) -> anyhow::Result<()>;

    fn get_value(&self, key: RunKey) -> anyhow::Result<Option<Value>>;
}

/// The generation side of one stored run. Scores are loaded separately.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub name: String,
    pub config: ExperimentConfig,
    pub variants: Vec<PromptVariant>,
    pub artifacts: Option<Artifacts>,
    pub results: Vec<RunResult>,
    pub assembled: Vec<AssembledPrompt>,
}

impl RunRecord {
    pub fn variant(&self, variant_id: &str) -> Option<&PromptVariant> {
        self.variants.iter().find(|variant| variant.id == variant_id)
    }

    pub fn result(&self, result_id: &str) -> Option<&RunResult> {
        self.results.iter().find(|result| result.id == result_id)
    }
}

/// Typed helpers over any [`RunStore`].
pub trait RunStoreExt: RunStore {
    fn put<T: Serialize + ?Sized>(&self, key: RunKey, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)?;
        self.put_value(key, &value)
    }

    fn get<T: DeserializeOwned>(&self, key: RunKey) -> anyhow::Result<Option<T>> {
        let Some(value) = self.get_value(key)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_value(value)
            .with_context(|| format!("malformed {} in {}", key.file_name(), self.location()))?;
        Ok(Some(parsed))
    }

    fn load_config(&self) -> anyhow::Result<Option<ExperimentConfig>> {
        self.get(RunKey::Config)
    }

    fn load_variants(&self) -> anyhow::Result<Vec<PromptVariant>> {
        Ok(self.get(RunKey::Variants)?.unwrap_or_default())
    }

    fn load_artifacts(&self) -> anyhow::Result<Option<Artifacts>> {
        self.get(RunKey::Artifacts)
    }

    fn load_results(&self) -> anyhow::Result<Vec<RunResult>> {
        Ok(self.get(RunKey::Results)?.unwrap_or_default())
    }

    fn load_assembled(&self) -> anyhow::Result<Vec<AssembledPrompt>> {
        Ok(self.get(RunKey::AssembledPrompts)?.unwrap_or_default())
    }

    fn load_scores(&self) -> anyhow::Result<Vec<Score>> {
        Ok(self.get(RunKey::Scores)?.unwrap_or_default())
    }

    fn load_judge_prompts(&self) -> anyhow::Result<Vec<JudgePromptRecord>> {
        Ok(self.get(RunKey::JudgePrompts)?.unwrap_or_default())
    }

    /// Everything a finished walk stored, for reconstruction and judging.
    fn load_record(&self) -> anyhow::Result<RunRecord> {
        let Some(config) = self.load_config()? else {
            bail!("run has no {}: {}", RunKey::Config.file_name(), self.location());
        };
        Ok(RunRecord {
            name: self.run_name(),
            config,
            variants: self.load_variants()?,
            artifacts: self.load_artifacts()?,
            results: self.load_results()?,
            assembled: self.load_assembled()?,
        })
    }

    /// Appends one walk step's result and prompt record, keeping both files in step.
    fn append_step(&self, result: &RunResult, assembled: &AssembledPrompt) -> anyhow::Result<()> {
        let mut results = self.load_results()?;
        results.push(result.clone());
        let mut prompts = self.load_assembled()?;
        prompts.push(assembled.clone());
        self.put(RunKey::Results, &results)?;
        self.put(RunKey::AssembledPrompts, &prompts)
    }

    /// Scores from different judges accumulate; existing rows are never rewritten.
    fn append_scores(
        &self,
        scores: &[Score],
        judge_prompts: &[JudgePromptRecord],
    ) -> anyhow::Result<()> {
        let mut all_scores = self.load_scores()?;
        all_scores.extend_from_slice(scores);
        self.put(RunKey::Scores, &all_scores)?;

        let mut all_prompts = self.load_judge_prompts()?;
        all_prompts.extend_from_slice(judge_prompts);
        self.put(RunKey::JudgePrompts, &all_prompts)
    }
}

impl<S: RunStore + ?Sized> RunStoreExt for S {}

/// One directory per run, one pretty-printed JSON file per key.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    root: PathBuf,
}

impl FsRunStore {
    /// Creates `<output>/<experiment_id>/<UTC timestamp>`.
    pub fn create(output_dir: &Path, experiment_id: &str) -> anyhow::Result<Self> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let parent = output_dir.join(experiment_id);
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let mut root = parent.join(&stamp);
        let mut suffix = 1;
        while root.exists() {
            root = parent.join(format!("{stamp}-{suffix}"));
            suffix += 1;
        }
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("run directory not found: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: RunKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

impl RunStore for FsRunStore {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn run_name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.location())
    }

    fn put_value(&self, key: RunKey, value: &Value) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(value)?;
        text.push('\n');
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn get_value(&self, key: RunKey) -> anyhow::Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        Ok(Some(value))
    }
}

/// Run directories under `<output>/<experiment_id>` that contain results, oldest first.
pub fn list_run_dirs(output_dir: &Path, experiment_id: &str) -> anyhow::Result<Vec<PathBuf>> {
    let parent = output_dir.join(experiment_id);
    if !parent.is_dir() {
        bail!("no output directory found: {}", parent.display());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&parent)? {
        let path = entry?.path();
        if path.is_dir() && path.join(RunKey::Results.file_name()).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    name: String,
    rows: Mutex<BTreeMap<RunKey, Value>>,
}

impl MemoryRunStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn keys(&self) -> Vec<RunKey> {
        self.rows
            .lock()
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl RunStore for MemoryRunStore {
    fn location(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn run_name(&self) -> String {
        self.name.clone()
    }

    fn put_value(&self, key: RunKey, value: &Value) -> anyhow::Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("run store lock poisoned"))?;
        rows.insert(key, value.clone());
        Ok(())
    }

    fn get_value(&self, key: RunKey) -> anyhow::Result<Option<Value>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("run store lock poisoned"))?;
        Ok(rows.get(&key).cloned())
    }
}
