pub mod artifacts;
pub mod images;
pub mod judge;
pub mod parametric;
pub mod providers;
pub mod reconstruct;
pub mod runner;
pub mod walk;

use serde_json::{Map, Value};

pub use runner::{
    freeze_artifacts, summarize_experiment, summarize_run, ArtifactOverride, EvaluationReport,
    GalleryRunner, JudgeOptions, WalkOptions, WalkRun,
};

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
