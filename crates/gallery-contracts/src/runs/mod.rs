pub mod manifest;
pub mod records;
pub mod store;
pub mod summary;

pub use manifest::RunManifest;
pub use records::{
    prompt_digest, AssembledPrompt, JudgePromptRecord, PromptFidelity, RunResult, Score,
    ScoreSource, TokenUsage, WalkStep,
};
pub use store::{
    list_run_dirs, FsRunStore, MemoryRunStore, RunKey, RunRecord, RunStore, RunStoreExt,
};
pub use summary::{aggregate, write_summary, ExperimentSummary, RunInfo, RunScores, ScoreStats};
