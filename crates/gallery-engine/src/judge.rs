//! Scores every (result, criterion) pair with a second model.

use anyhow::{bail, Context, Result};
use gallery_contracts::events::EventWriter;
use gallery_contracts::experiment::{Criterion, ImageInput};
use gallery_contracts::parsing::parse_judge_response;
use gallery_contracts::runs::{JudgePromptRecord, PromptFidelity, RunResult, Score};
use serde_json::json;

use crate::images::ImageCache;
use crate::map_object;
use crate::providers::{truncate_text, ModelHandle};
use crate::reconstruct::{Reconstruction, StepContext};

pub const JUDGE_TEMPERATURE: f64 = 0.3;
pub const JUDGE_MAX_TOKENS: u64 = 512;

pub const JUDGE_SYSTEM_PROMPT: &str = "\
You are an expert evaluator assessing LLM-generated responses to images.
You will be given:
- The prompt that was sent to the model
- The model's response
- A specific evaluation criterion with a scoring rubric

Score the response on a scale of 1-5 according to the criterion.

You MUST respond in exactly this format:

SCORE: <number 1-5>
RATIONALE: <2-4 sentences explaining the score>

Nothing else. No preamble, no markdown.";

/// Judge prompt for one result under one criterion.
pub fn judge_user_prompt(context: &StepContext, response: &str, criterion: &Criterion) -> String {
    format!(
        "## Prompt sent to the model\n\n\
         System: {system}\n\n\
         User: {user}\n\n\
         ## Position in the gallery\n\n\
         {position}\n\n\
         ## Model response\n\n\
         {response}\n\n\
         ## Evaluation criterion: {name}\n\n\
         {description}\n\n\
         {rubric}\n\n\
         Score this response (1-5) according to the criterion above.",
        system = context.system_prompt,
        user = context.user_prompt,
        position = context.judge_context,
        name = criterion.name,
        description = criterion.description,
        rubric = criterion.scoring_prompt,
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub scores: Vec<Score>,
    pub judge_prompts: Vec<JudgePromptRecord>,
}

impl Evaluation {
    pub fn unparsed(&self) -> usize {
        self.scores.iter().filter(|score| score.is_sentinel()).count()
    }
}

pub struct JudgeEvaluator<'a> {
    judge: &'a ModelHandle,
    events: &'a EventWriter,
}

impl<'a> JudgeEvaluator<'a> {
    pub fn new(judge: &'a ModelHandle, events: &'a EventWriter) -> Self {
        Self { judge, events }
    }

    /// One judge call per (result, criterion). Provider errors abort the pass.
    pub fn evaluate(
        &self,
        results: &[RunResult],
        contexts: &Reconstruction,
        criteria: &[Criterion],
        images: &[ImageInput],
        cache: &mut ImageCache,
    ) -> Result<Evaluation> {
        let judge_model = self.judge.label();
        let mut evaluation = Evaluation::default();

        for result in results {
            let Some(context) = contexts.get(&result.id) else {
                bail!("no reconstructed prompt for result {}", result.id);
            };
            for criterion in criteria {
                let user_prompt = judge_user_prompt(context, &result.raw_response, criterion);
                let image = if criterion.requires_image {
                    let Some(input) = images.iter().find(|image| image.id == result.image_id)
                    else {
                        bail!(
                            "criterion '{}' needs image '{}', which is not in the experiment config",
                            criterion.id,
                            result.image_id
                        );
                    };
                    Some(cache.get(input)?)
                } else {
                    None
                };

                let reply = self
                    .judge
                    .generate(
                        JUDGE_SYSTEM_PROMPT,
                        &user_prompt,
                        image.as_deref(),
                        JUDGE_TEMPERATURE,
                        JUDGE_MAX_TOKENS,
                    )
                    .with_context(|| {
                        format!(
                            "judging result {} on criterion '{}' failed",
                            result.id, criterion.id
                        )
                    })?;

                let verdict = parse_judge_response(&reply.content);
                let score = Score::from_judge(
                    &result.id,
                    &criterion.id,
                    verdict.score,
                    verdict.rationale,
                    &judge_model,
                    contexts.fidelity,
                );
                if score.is_sentinel() {
                    self.events.emit(
                        "judge_unparsed",
                        map_object(json!({
                            "result_id": result.id,
                            "criterion_id": criterion.id,
                            "reply": truncate_text(&reply.content, 200),
                        })),
                    )?;
                } else {
                    self.events.emit(
                        "judge_scored",
                        map_object(json!({
                            "result_id": result.id,
                            "criterion_id": criterion.id,
                            "score": score.score,
                        })),
                    )?;
                }

                evaluation.judge_prompts.push(JudgePromptRecord {
                    score_id: score.id.clone(),
                    run_result_id: result.id.clone(),
                    criterion_id: criterion.id.clone(),
                    judge_model: judge_model.clone(),
                    system_prompt: JUDGE_SYSTEM_PROMPT.to_string(),
                    user_prompt,
                    image_attached: image.is_some(),
                    prompt_fidelity: contexts.fidelity,
                });
                evaluation.scores.push(score);
            }
        }

        self.events.emit(
            "evaluation_finished",
            map_object(json!({
                "judge_model": judge_model,
                "scores": evaluation.scores.len(),
                "unparsed": evaluation.unparsed(),
                "prompt_fidelity": contexts.fidelity.as_str(),
                "low_confidence": contexts.fidelity == PromptFidelity::Degraded,
            })),
        )?;
        Ok(evaluation)
    }
}
