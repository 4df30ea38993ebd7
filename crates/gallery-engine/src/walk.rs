//! The gallery walk: one model call per image, state threaded between calls.

use anyhow::{Context, Result};
use gallery_contracts::events::EventWriter;
use gallery_contracts::experiment::{Artifacts, ImageInput, PromptVariant};
use gallery_contracts::parsing::parse_response;
use gallery_contracts::runs::{
    AssembledPrompt, RunResult, RunStore, RunStoreExt, TokenUsage, WalkStep,
};
use gallery_contracts::template::{assemble_user_prompt, validate, PromptFields};
use serde_json::json;

use crate::images::ImageCache;
use crate::map_object;
use crate::providers::ModelHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkSettings {
    pub temperature: f64,
    pub max_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkOutcome {
    pub variant_id: String,
    pub steps: Vec<WalkStep>,
    pub final_state: String,
}

impl WalkOutcome {
    /// Steps whose reply carried no successor state.
    pub fn carried_forward(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.parsed_state.is_empty())
            .count()
    }
}

pub struct GalleryWalk<'a> {
    model: &'a ModelHandle,
    store: &'a dyn RunStore,
    events: &'a EventWriter,
    settings: WalkSettings,
}

impl<'a> GalleryWalk<'a> {
    pub fn new(
        model: &'a ModelHandle,
        store: &'a dyn RunStore,
        events: &'a EventWriter,
        settings: WalkSettings,
    ) -> Self {
        Self {
            model,
            store,
            events,
            settings,
        }
    }

    /// Walks every variant in order, each from the same initial state.
    /// All templates are checked before the first model call.
    pub fn run_all(
        &self,
        variants: &[PromptVariant],
        artifacts: &Artifacts,
        images: &[ImageInput],
        cache: &mut ImageCache,
    ) -> Result<Vec<WalkOutcome>> {
        for variant in variants {
            check_template(variant)?;
        }
        variants
            .iter()
            .map(|variant| self.run(variant, artifacts, images, cache))
            .collect()
    }

    pub fn run(
        &self,
        variant: &PromptVariant,
        artifacts: &Artifacts,
        images: &[ImageInput],
        cache: &mut ImageCache,
    ) -> Result<WalkOutcome> {
        check_template(variant)?;
        self.events.emit(
            "walk_started",
            map_object(json!({
                "variant_id": variant.id,
                "images": images.len(),
                "provider": self.model.provider_name(),
                "model": self.model.model(),
            })),
        )?;

        let mut current_state = artifacts.initial_state.clone();
        let mut steps = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let step = self.step(variant, artifacts, image, &current_state, cache)?;
            if step.parsed_state.is_empty() {
                self.events.emit(
                    "state_carried_forward",
                    map_object(json!({
                        "variant_id": variant.id,
                        "image_id": image.id,
                        "index": index,
                        "format": step.format.as_str(),
                    })),
                )?;
            } else {
                current_state = step.parsed_state.clone();
            }
            self.events.emit(
                "step_completed",
                map_object(json!({
                    "variant_id": variant.id,
                    "image_id": image.id,
                    "index": index,
                    "result_id": step.result.id,
                    "format": step.format.as_str(),
                    "latency_ms": step.result.latency_ms,
                })),
            )?;
            steps.push(step);
        }

        self.events.emit(
            "walk_finished",
            map_object(json!({
                "variant_id": variant.id,
                "steps": steps.len(),
                "final_state": current_state,
            })),
        )?;
        Ok(WalkOutcome {
            variant_id: variant.id.clone(),
            steps,
            final_state: current_state,
        })
    }

    fn step(
        &self,
        variant: &PromptVariant,
        artifacts: &Artifacts,
        image: &ImageInput,
        current_state: &str,
        cache: &mut ImageCache,
    ) -> Result<WalkStep> {
        let fields = PromptFields {
            profile: &artifacts.profile,
            style: &artifacts.style,
            current_state,
        };
        let user_prompt =
            assemble_user_prompt(&variant.user_prompt, &fields, image.caption.as_deref())
                .with_context(|| format!("variant '{}' template", variant.id))?;
        let bytes = cache.get(image)?;

        let response = self
            .model
            .generate(
                &variant.system_prompt,
                &user_prompt,
                Some(&*bytes),
                self.settings.temperature,
                self.settings.max_tokens,
            )
            .with_context(|| format!("walk '{}' failed at image '{}'", variant.id, image.id))?;

        let mut result = RunResult::new(
            &variant.id,
            &image.id,
            self.model.provider_name(),
            self.model.model(),
            response.content,
        );
        result.latency_ms = response.latency_ms;
        result.token_usage = TokenUsage {
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
        };
        let assembled = AssembledPrompt::new(&result, &variant.system_prompt, &user_prompt);
        self.store
            .append_step(&result, &assembled)
            .with_context(|| format!("failed to persist step for image '{}'", image.id))?;

        let parsed = parse_response(&result.raw_response);
        Ok(WalkStep::new(result, assembled, parsed, current_state))
    }
}

fn check_template(variant: &PromptVariant) -> Result<()> {
    validate(&variant.user_prompt).with_context(|| format!("variant '{}' template", variant.id))
}

#[cfg(test)]
mod tests {
    use gallery_contracts::parsing::ResponseFormat;
    use gallery_contracts::runs::MemoryRunStore;
    use gallery_contracts::template::TemplateError;

    use super::*;
    use crate::images::testing::static_cache;
    use crate::providers::scripted::ScriptedProvider;

    fn artifacts() -> Artifacts {
        Artifacts {
            profile: "P".to_string(),
            style: "S".to_string(),
            initial_state: "calm".to_string(),
            provenance: Vec::new(),
        }
    }

    fn variant(id: &str) -> PromptVariant {
        PromptVariant {
            id: id.to_string(),
            name: id.to_string(),
            system_prompt: "You walk a gallery.".to_string(),
            user_prompt: "{profile}/{style} state: {current_state}".to_string(),
        }
    }

    fn images(ids: &[&str]) -> Vec<ImageInput> {
        ids.iter()
            .map(|id| ImageInput {
                id: id.to_string(),
                source: format!("{id}.png"),
                caption: None,
            })
            .collect()
    }

    const SETTINGS: WalkSettings = WalkSettings {
        temperature: 0.7,
        max_tokens: 2048,
    };

    #[test]
    fn state_threads_forward_and_survives_a_parse_miss() -> Result<()> {
        let provider = ScriptedProvider::new(
            "scripted",
            &["[REFLECTION] the sea unsettles me [STATE] restless", "I just liked it."],
        );
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, _) = static_cache();
        let walk = GalleryWalk::new(&model, &store, &events, SETTINGS);

        let outcome = walk.run(&variant("v1"), &artifacts(), &images(&["a", "b"]), &mut cache)?;

        let requests = provider.requests();
        assert_eq!(requests[0].user_prompt, "P/S state: calm");
        assert_eq!(requests[1].user_prompt, "P/S state: restless");
        assert_eq!(requests[0].image_mime.as_deref(), Some("image/png"));
        assert_eq!(requests[0].max_tokens, 2048);
        assert_eq!(outcome.final_state, "restless");
        assert_eq!(outcome.steps[0].format, ResponseFormat::Tagged);
        assert_eq!(outcome.steps[1].format, ResponseFormat::Unstructured);
        assert_eq!(outcome.steps[1].state_in, "restless");
        assert_eq!(outcome.carried_forward(), 1);
        assert!(events
            .event_types()
            .contains(&"state_carried_forward".to_string()));
        Ok(())
    }

    #[test]
    fn multi_line_replies_thread_state_and_keep_it_on_an_empty_block() -> Result<()> {
        let provider = ScriptedProvider::new(
            "scripted",
            &[
                "[REFLECTION]\n\nThe harbor light is harsh.\n\n[STATE]\n\nrestless",
                "[REFLECTION]\n\nA quiet interior, nothing moves.\n\n[STATE]\n\n",
            ],
        );
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, _) = static_cache();

        let outcome = GalleryWalk::new(&model, &store, &events, SETTINGS).run(
            &variant("v1"),
            &artifacts(),
            &images(&["a", "b"]),
            &mut cache,
        )?;

        let requests = provider.requests();
        assert_eq!(requests[0].user_prompt, "P/S state: calm");
        assert_eq!(requests[1].user_prompt, "P/S state: restless");
        assert_eq!(outcome.steps[0].parsed_reflection, "The harbor light is harsh.");
        assert_eq!(outcome.steps[0].parsed_state, "restless");
        assert_eq!(outcome.steps[1].format, ResponseFormat::Tagged);
        assert_eq!(outcome.steps[1].parsed_state, "");
        assert_eq!(outcome.final_state, "restless");
        assert_eq!(outcome.carried_forward(), 1);
        Ok(())
    }

    #[test]
    fn recorded_prompts_match_what_was_sent() -> Result<()> {
        let provider = ScriptedProvider::new(
            "scripted",
            &["[REFLECTION] seen [STATE] a", "[REFLECTION] seen [STATE] b"],
        );
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, _) = static_cache();
        let mut gallery = images(&["a", "b"]);
        gallery[1].caption = Some("Storm at sea".to_string());

        GalleryWalk::new(&model, &store, &events, SETTINGS).run(
            &variant("v1"),
            &artifacts(),
            &gallery,
            &mut cache,
        )?;

        let sent = provider.requests();
        let recorded = store.load_assembled()?;
        let results = store.load_results()?;
        assert_eq!(recorded.len(), 2);
        for (request, record) in sent.iter().zip(&recorded) {
            assert_eq!(request.user_prompt, record.user_prompt);
            assert_eq!(request.system_prompt, record.system_prompt);
            assert!(record.digest_matches());
        }
        assert!(recorded[1]
            .user_prompt
            .ends_with("\n\nThe image caption: \"Storm at sea\""));
        assert_eq!(results[1].id, recorded[1].result_id);
        assert_eq!(results[0].provider, "scripted");
        assert_eq!(results[0].token_usage.prompt_tokens, Some(1));
        Ok(())
    }

    #[test]
    fn provider_failure_aborts_and_keeps_completed_steps() -> Result<()> {
        let provider = ScriptedProvider::new("scripted", &["[REFLECTION] seen [STATE] a"]);
        provider.fail_next("upstream 503");
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, _) = static_cache();

        let err = GalleryWalk::new(&model, &store, &events, SETTINGS)
            .run(&variant("v1"), &artifacts(), &images(&["a", "b", "c"]), &mut cache)
            .err()
            .context("expected failure")?;

        assert!(format!("{err:#}").contains("upstream 503"));
        assert_eq!(store.load_results()?.len(), 1);
        assert_eq!(store.load_assembled()?.len(), 1);
        assert_eq!(provider.requests().len(), 2);
        assert!(!events.event_types().contains(&"walk_finished".to_string()));
        Ok(())
    }

    #[test]
    fn each_variant_starts_from_the_initial_state() -> Result<()> {
        let provider = ScriptedProvider::new(
            "scripted",
            &[
                "[REFLECTION] seen [STATE] tense",
                "[REFLECTION] seen [STATE] tired",
                "[REFLECTION] seen [STATE] bright",
                "[REFLECTION] seen [STATE] hungry",
            ],
        );
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, loads) = static_cache();

        let outcomes = GalleryWalk::new(&model, &store, &events, SETTINGS).run_all(
            &[variant("v1"), variant("v2")],
            &artifacts(),
            &images(&["a", "b"]),
            &mut cache,
        )?;

        let requests = provider.requests();
        assert_eq!(requests[0].user_prompt, "P/S state: calm");
        assert_eq!(requests[2].user_prompt, "P/S state: calm");
        assert_eq!(outcomes[0].final_state, "tired");
        assert_eq!(outcomes[1].final_state, "hungry");
        assert_eq!(loads.borrow().len(), 2);
        let variants: Vec<String> = store
            .load_results()?
            .into_iter()
            .map(|result| result.prompt_variant_id)
            .collect();
        assert_eq!(variants, vec!["v1", "v1", "v2", "v2"]);
        Ok(())
    }

    #[test]
    fn bad_template_fails_before_any_call() -> Result<()> {
        let provider = ScriptedProvider::new("scripted", &["[REFLECTION] seen [STATE] a"]);
        let model = provider.handle("vlm");
        let store = MemoryRunStore::new("run");
        let events = EventWriter::in_memory("run");
        let (mut cache, _) = static_cache();
        let mut broken = variant("v2");
        broken.user_prompt = "{current_state} and {mood}".to_string();

        let err = GalleryWalk::new(&model, &store, &events, SETTINGS)
            .run_all(&[variant("v1"), broken], &artifacts(), &images(&["a"]), &mut cache)
            .err()
            .context("expected failure")?;

        assert!(matches!(
            err.downcast_ref::<TemplateError>(),
            Some(TemplateError::UnknownPlaceholder(name)) if name == "mood"
        ));
        assert!(provider.requests().is_empty());
        assert!(store.keys().is_empty());
        Ok(())
    }
}
