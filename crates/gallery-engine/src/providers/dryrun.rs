use anyhow::Result;
use gallery_contracts::runs::prompt_digest;

use super::{GenerateRequest, ProviderResponse, VisionProvider};

/// Offline provider with deterministic replies in the shapes the pipeline parses.
pub struct DryrunProvider;

impl DryrunProvider {
    fn reply(request: &GenerateRequest<'_>) -> String {
        let digest = prompt_digest(&format!("{}\n{}", request.system_prompt, request.user_prompt));
        let short = &digest[..8];
        if request.user_prompt.contains("Score this response") {
            return format!("SCORE: 3\nRATIONALE: Dry run judgment {short}.");
        }
        if request.image.is_some() {
            return format!(
                "[REFLECTION]\n\nDry run reflection {short}.\n\n[STATE]\n\ndry run state {short}"
            );
        }
        format!("Dry run text {short}.")
    }
}

impl VisionProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<ProviderResponse> {
        let content = Self::reply(request);
        let prompt_words = request.system_prompt.split_whitespace().count()
            + request.user_prompt.split_whitespace().count();
        Ok(ProviderResponse {
            prompt_tokens: Some(prompt_words as u64),
            completion_tokens: Some(content.split_whitespace().count() as u64),
            content,
            latency_ms: 0,
        })
    }
}
