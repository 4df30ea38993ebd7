use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::parsing::{ParsedResponse, ResponseFormat};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// One model reply for one image of one walk. Never mutated after it is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub id: String,
    pub prompt_variant_id: String,
    pub image_id: String,
    pub provider: String,
    pub model: String,
    pub raw_response: String,
    pub timestamp: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl RunResult {
    pub fn new(
        prompt_variant_id: &str,
        image_id: &str,
        provider: &str,
        model: &str,
        raw_response: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt_variant_id: prompt_variant_id.to_string(),
            image_id: image_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            raw_response,
            timestamp: now_utc_iso(),
            latency_ms: 0,
            token_usage: TokenUsage::default(),
        }
    }
}

/// The prompt text exactly as sent for one result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub result_id: String,
    pub prompt_variant_id: String,
    pub image_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(default)]
    pub prompt_sha256: String,
}

impl AssembledPrompt {
    pub fn new(result: &RunResult, system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            result_id: result.id.clone(),
            prompt_variant_id: result.prompt_variant_id.clone(),
            image_id: result.image_id.clone(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            prompt_sha256: prompt_digest(user_prompt),
        }
    }

    /// False when the stored digest no longer matches the stored text.
    /// Records written without a digest are accepted as-is.
    pub fn digest_matches(&self) -> bool {
        self.prompt_sha256.is_empty() || self.prompt_sha256 == prompt_digest(&self.user_prompt)
    }
}

pub fn prompt_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// One completed step of a walk, as handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkStep {
    pub result: RunResult,
    pub assembled: AssembledPrompt,
    pub parsed_reflection: String,
    pub parsed_state: String,
    pub format: ResponseFormat,
    /// State that was substituted into this step's prompt.
    pub state_in: String,
}

impl WalkStep {
    pub fn new(
        result: RunResult,
        assembled: AssembledPrompt,
        parsed: ParsedResponse,
        state_in: &str,
    ) -> Self {
        Self {
            result,
            assembled,
            parsed_reflection: parsed.reflection,
            parsed_state: parsed.state,
            format: parsed.format,
            state_in: state_in.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Llm,
    Human,
}

/// Which reconstruction tier produced the context a score was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFidelity {
    Exact,
    Replayed,
    Degraded,
}

impl PromptFidelity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Replayed => "replayed",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub id: String,
    pub run_result_id: String,
    pub criterion_id: String,
    /// 1..=5, or 0 when the judge reply could not be parsed.
    pub score: u8,
    pub rationale: String,
    pub judge_model: String,
    pub source: ScoreSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_fidelity: Option<PromptFidelity>,
    #[serde(default)]
    pub created_at: String,
}

impl Score {
    pub fn from_judge(
        run_result_id: &str,
        criterion_id: &str,
        score: u8,
        rationale: String,
        judge_model: &str,
        prompt_fidelity: PromptFidelity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_result_id: run_result_id.to_string(),
            criterion_id: criterion_id.to_string(),
            score,
            rationale,
            judge_model: judge_model.to_string(),
            source: ScoreSource::Llm,
            prompt_fidelity: Some(prompt_fidelity),
            created_at: now_utc_iso(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.score == crate::parsing::SENTINEL_SCORE
    }
}

/// The full prompt a judge saw for one score, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgePromptRecord {
    pub score_id: String,
    pub run_result_id: String,
    pub criterion_id: String,
    pub judge_model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub image_attached: bool,
    pub prompt_fidelity: PromptFidelity,
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
