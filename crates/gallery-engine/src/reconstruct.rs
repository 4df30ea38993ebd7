//! Rebuilds the prompt context each step of a stored walk was given.
//!
//! Tiers are tried from most to least faithful:
//!
//! - `exact`: the assembled prompts recorded during the walk
//! - `replayed`: the state chain re-derived by parsing the raw replies
//! - `degraded`: the bare template for every step
//!
//! The judge context (which images came before, and where this one sits)
//! is derived from the configured image order and does not depend on tier.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use gallery_contracts::events::EventWriter;
use gallery_contracts::experiment::ImageInput;
use gallery_contracts::parsing::parse_response;
use gallery_contracts::runs::{PromptFidelity, RunRecord, RunResult};
use gallery_contracts::template::{assemble_user_prompt, PromptFields};
use serde_json::json;
use similar::TextDiff;

use crate::map_object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// What a judge needs to know about the step that produced one result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub result_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub judge_context: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub fidelity: PromptFidelity,
    contexts: BTreeMap<String, StepContext>,
}

impl Reconstruction {
    pub fn get(&self, result_id: &str) -> Option<&StepContext> {
        self.contexts.get(result_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// One way of recovering per-result prompts. `Ok(None)` means not applicable.
/// A returned list lines up index for index with `run.results`.
pub trait ReconstructionTier {
    fn fidelity(&self) -> PromptFidelity;
    fn reconstruct(&self, run: &RunRecord) -> Result<Option<Vec<PromptPair>>>;
}

/// Uses recorded prompts verbatim; applies only when every result has an
/// intact record.
pub struct ExactTier;

impl ReconstructionTier for ExactTier {
    fn fidelity(&self) -> PromptFidelity {
        PromptFidelity::Exact
    }

    fn reconstruct(&self, run: &RunRecord) -> Result<Option<Vec<PromptPair>>> {
        let by_result: HashMap<&str, _> = run
            .assembled
            .iter()
            .map(|record| (record.result_id.as_str(), record))
            .collect();
        let mut pairs = Vec::with_capacity(run.results.len());
        for result in &run.results {
            let Some(record) = by_result.get(result.id.as_str()) else {
                return Ok(None);
            };
            if !record.digest_matches() {
                return Ok(None);
            }
            pairs.push(PromptPair {
                system_prompt: record.system_prompt.clone(),
                user_prompt: record.user_prompt.clone(),
            });
        }
        Ok(Some(pairs))
    }
}

/// Re-runs the walk's prompt assembly offline, feeding each stored reply
/// back through the parser to recover the state chain.
pub struct ReplayTier;

impl ReconstructionTier for ReplayTier {
    fn fidelity(&self) -> PromptFidelity {
        PromptFidelity::Replayed
    }

    fn reconstruct(&self, run: &RunRecord) -> Result<Option<Vec<PromptPair>>> {
        let Some(artifacts) = &run.artifacts else {
            return Ok(None);
        };
        let config = &run.config;
        let position =
            |result: &RunResult| config.image_position(&result.image_id).unwrap_or(usize::MAX);

        let mut pairs: Vec<Option<PromptPair>> = vec![None; run.results.len()];
        for (variant_id, mut indices) in indices_by_variant(&run.results) {
            let Some(variant) = run.variant(variant_id) else {
                return Ok(None);
            };
            indices.sort_by_key(|idx| position(&run.results[*idx]));

            let mut state = artifacts.initial_state.clone();
            for idx in indices {
                let result = &run.results[idx];
                let caption = config
                    .image(&result.image_id)
                    .and_then(|image| image.caption.as_deref());
                let fields = PromptFields {
                    profile: &artifacts.profile,
                    style: &artifacts.style,
                    current_state: &state,
                };
                let Ok(user_prompt) = assemble_user_prompt(&variant.user_prompt, &fields, caption)
                else {
                    return Ok(None);
                };
                pairs[idx] = Some(PromptPair {
                    system_prompt: variant.system_prompt.clone(),
                    user_prompt,
                });
                let parsed = parse_response(&result.raw_response);
                if parsed.has_state() {
                    state = parsed.state;
                }
            }
        }
        Ok(pairs.into_iter().collect())
    }
}

/// The unsubstituted template for every step. Always applies.
pub struct DegradedTier;

impl ReconstructionTier for DegradedTier {
    fn fidelity(&self) -> PromptFidelity {
        PromptFidelity::Degraded
    }

    fn reconstruct(&self, run: &RunRecord) -> Result<Option<Vec<PromptPair>>> {
        let pairs = run
            .results
            .iter()
            .map(|result| match run.variant(&result.prompt_variant_id) {
                Some(variant) => PromptPair {
                    system_prompt: variant.system_prompt.clone(),
                    user_prompt: variant.user_prompt.clone(),
                },
                None => PromptPair {
                    system_prompt: String::new(),
                    user_prompt: String::new(),
                },
            })
            .collect();
        Ok(Some(pairs))
    }
}

fn indices_by_variant(results: &[RunResult]) -> BTreeMap<&str, Vec<usize>> {
    let mut grouped: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, result) in results.iter().enumerate() {
        grouped
            .entry(result.prompt_variant_id.as_str())
            .or_default()
            .push(idx);
    }
    grouped
}

/// Lists every image shown strictly before `image_id`, then marks its position.
pub fn judge_context(images: &[ImageInput], image_id: &str) -> String {
    let Some(position) = images.iter().position(|image| image.id == image_id) else {
        return format!("Image {image_id} is not part of the configured sequence.");
    };
    let mut lines = Vec::new();
    if position > 0 {
        lines.push("Images shown before this one, in order:".to_string());
        for (idx, image) in images[..position].iter().enumerate() {
            match image.caption.as_deref().filter(|caption| !caption.is_empty()) {
                Some(caption) => lines.push(format!("{}. {}: \"{caption}\"", idx + 1, image.id)),
                None => lines.push(format!("{}. {}", idx + 1, image.id)),
            }
        }
        lines.push(String::new());
    }
    lines.push(format!(
        "This is image {} of {} ({image_id}).",
        position + 1,
        images.len()
    ));
    lines.join("\n")
}

pub struct PromptReconstructor {
    tiers: Vec<Box<dyn ReconstructionTier>>,
    events: EventWriter,
}

impl PromptReconstructor {
    pub fn new(events: EventWriter) -> Self {
        Self {
            tiers: Vec::new(),
            events,
        }
    }

    pub fn standard(events: EventWriter) -> Self {
        Self::new(events)
            .with_tier(ExactTier)
            .with_tier(ReplayTier)
            .with_tier(DegradedTier)
    }

    pub fn with_tier<T: ReconstructionTier + 'static>(mut self, tier: T) -> Self {
        self.tiers.push(Box::new(tier));
        self
    }

    pub fn reconstruct(&self, run: &RunRecord) -> Result<Reconstruction> {
        for tier in &self.tiers {
            let Some(pairs) = tier.reconstruct(run)? else {
                continue;
            };
            let fidelity = tier.fidelity();
            if fidelity != PromptFidelity::Exact {
                self.events.emit(
                    "reconstruction_degraded",
                    map_object(json!({
                        "run": run.name,
                        "fidelity": fidelity.as_str(),
                        "results": run.results.len(),
                        "recorded_prompts": run.assembled.len(),
                    })),
                )?;
            }
            let contexts = run
                .results
                .iter()
                .zip(pairs)
                .map(|(result, pair)| {
                    let context = StepContext {
                        result_id: result.id.clone(),
                        system_prompt: pair.system_prompt,
                        user_prompt: pair.user_prompt,
                        judge_context: judge_context(&run.config.images, &result.image_id),
                    };
                    (result.id.clone(), context)
                })
                .collect();
            return Ok(Reconstruction { fidelity, contexts });
        }
        anyhow::bail!("no reconstruction tier applied to run {}", run.name)
    }
}

/// The first step where recorded and replayed prompts disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMismatch {
    pub result_id: String,
    pub prompt_variant_id: String,
    pub image_id: String,
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierComparison {
    pub steps_compared: usize,
    pub first_mismatch: Option<StepMismatch>,
}

impl TierComparison {
    pub fn matches(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

/// Compares recorded prompts against a fresh replay. Equal output means the
/// template and parser still reproduce what the walk sent.
pub fn compare_recorded_with_replay(run: &RunRecord) -> Result<TierComparison> {
    let Some(recorded) = ExactTier.reconstruct(run)? else {
        anyhow::bail!("run {} has incomplete or altered prompt records", run.name);
    };
    let Some(replayed) = ReplayTier.reconstruct(run)? else {
        anyhow::bail!(
            "run {} cannot be replayed (missing artifacts, variants, or a valid template)",
            run.name
        );
    };
    for ((result, recorded), replayed) in run.results.iter().zip(&recorded).zip(&replayed) {
        if recorded == replayed {
            continue;
        }
        let old = format!("{}\n---\n{}\n", recorded.system_prompt, recorded.user_prompt);
        let new = format!("{}\n---\n{}\n", replayed.system_prompt, replayed.user_prompt);
        let diff = TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header("recorded", "replayed")
            .to_string();
        return Ok(TierComparison {
            steps_compared: run.results.len(),
            first_mismatch: Some(StepMismatch {
                result_id: result.id.clone(),
                prompt_variant_id: result.prompt_variant_id.clone(),
                image_id: result.image_id.clone(),
                diff,
            }),
        });
    }
    Ok(TierComparison {
        steps_compared: run.results.len(),
        first_mismatch: None,
    })
}
