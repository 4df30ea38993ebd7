//! Parametric hints for artifact generation.
//!
//! Each hint pins a random subset (2 to 4 of 7) of the artifact's dimensions
//! and leaves the rest for the model to fill in.

use std::collections::HashSet;

use anyhow::{bail, Result};
use gallery_contracts::experiment::{ArtifactKind, GenerationPrompts, PromptVariant};
use rand::seq::SliceRandom;
use rand::Rng;

pub const MIN_DIMS: usize = 2;
pub const MAX_DIMS: usize = 4;

const MAX_ID_ATTEMPTS: usize = 32;

/// (dimension, value pool, phrase with `{val}`)
type Dimension = (&'static str, &'static [&'static str], &'static str);

const PROFILE_DIMENSIONS: &[Dimension] = &[
    (
        "ambiguity_tolerance",
        &["low", "moderate-to-low", "moderate", "moderate-to-high", "high", "very high"],
        "{val} ambiguity tolerance",
    ),
    (
        "attention_style",
        &[
            "absorbed and dwelling",
            "scanning and restless",
            "mixed, lingering on some things and skipping others quickly",
        ],
        "{val} attention",
    ),
    (
        "embodied_orientation",
        &[
            "strongly somatic",
            "more somatic than cognitive",
            "balanced between somatic and cognitive",
            "more cognitive than somatic",
            "strongly cognitive",
        ],
        "an embodied orientation that is {val}",
    ),
    (
        "interpretive_posture",
        &[
            "primarily literal and descriptive",
            "primarily symbolic and associative",
            "primarily autobiographical",
            "symbolic with occasional autobiographical flashes",
            "literal with occasional symbolic leaps",
            "autobiographical with a symbolic undercurrent",
        ],
        "an interpretive posture that is {val}",
    ),
    (
        "aesthetic_conditioning",
        &[
            "naïve, with little exposure to non-explanatory art",
            "moderate, shaped by popular cinema and illustration",
            "moderate, shaped by photography and architecture",
            "moderate, shaped by literature and graphic novels",
            "high, shaped by contemporary photography and experimental cinema",
            "high, shaped by contemporary dance, performance, and installation art",
            "high, shaped by literature, poetry, and theatre",
            "high, shaped by graphic design, typography, and visual culture",
            "high, shaped by painting and sculpture",
        ],
        "aesthetic conditioning: {val}",
    ),
    (
        "motivational_stance",
        &[
            "strongly seeking challenge and novelty",
            "leaning toward challenge but open to comfort",
            "mixed, sometimes seeking disruption and sometimes reassurance",
            "leaning toward comfort and familiarity",
            "strongly seeking comfort and familiarity",
        ],
        "motivationally {val}",
    ),
    (
        "memory_integration",
        &[
            "strongly integrative and accumulative",
            "leaning integrative, with threads building loosely",
            "mixed, sometimes integrating and sometimes resetting",
            "leaning discrete, each work mostly fresh",
            "strongly discrete, each encounter resets",
        ],
        "memory integration that is {val}",
    ),
];

const STYLE_DIMENSIONS: &[Dimension] = &[
    (
        "lexical_register",
        &[
            "plain and conversational",
            "conversational with occasional precision",
            "moderately formal and precise",
            "literary and textured",
            "literary and poetic, occasionally archaic",
        ],
        "a {val} register",
    ),
    (
        "emotion_explicitness",
        &[
            "implicit, surfacing through imagery and indirection",
            "mostly implicit with rare direct naming",
            "mixed, sometimes named and sometimes suggested",
            "mostly explicit, with feelings named directly",
            "explicitly named as a grounding habit",
        ],
        "emotion that is {val}",
    ),
    (
        "voice_stability",
        &[
            "steady and composed throughout",
            "mostly steady with small self-corrections",
            "stable but occasionally fracturing under pressure",
            "unstable, with shifting register, hesitations and reversals",
            "deliberately fragmented: staccato, half-starts, abrupt stops",
        ],
        "voice stability: {val}",
    ),
    (
        "sensory_modality",
        &[
            "primarily visual",
            "primarily kinesthetic and bodily",
            "primarily auditory",
            "mixed visual and kinesthetic",
            "mixed, moving freely between all senses",
        ],
        "sensory emphasis that is {val}",
    ),
    (
        "self_reference",
        &[
            "first-person intimate ('I', 'my', 'me')",
            "first-person but occasionally stepping back",
            "mixed, toggling between 'I' and impersonal constructions",
            "mostly observational ('one notices', 'there is')",
            "fully impersonal, with no 'I' at all",
        ],
        "self-reference: {val}",
    ),
    (
        "metaphor_density",
        &[
            "spare and literal, almost no figurative language",
            "sparse, brief functional metaphors only",
            "moderate, occasional analogies and similes",
            "rich, frequent figurative expression",
            "dense, sustained metaphorical fields",
        ],
        "metaphor that is {val}",
    ),
    (
        "pacing",
        &[
            "terse and compressed, fragments and short bursts",
            "clipped but not fragmented, short to medium sentences",
            "medium and measured",
            "flowing, longer sentences with internal movement",
            "expansive, long unspooling clauses and slow cadence",
        ],
        "pacing: {val}",
    ),
];

const STATE_DIMENSIONS: &[Dimension] = &[
    (
        "dominant_mood",
        &[
            "calm", "restless", "melancholic", "alert", "apprehensive", "buoyant", "numb",
            "wistful", "irritable", "curious", "flat", "anxious", "elated", "heavy", "distracted",
        ],
        "feeling {val}",
    ),
    (
        "underlying_tension",
        &[
            "settled ease with no underlying tightness",
            "subtle anticipation",
            "a faint hum of unresolved tension",
            "noticeable tightness, something braced",
            "deep tension held in the body",
        ],
        "with {val} underneath",
    ),
    (
        "energy_engagement",
        &[
            "depleted and fatigued",
            "low energy, reluctant",
            "moderate, enough to engage without strain",
            "high energy, ready to engage",
            "very high, almost restless with readiness",
        ],
        "energy: {val}",
    ),
    (
        "emotional_openness",
        &[
            "guarded and defended",
            "somewhat guarded, defenses up but not rigid",
            "moderately receptive",
            "receptive and permeable",
            "unusually open, willing to be moved",
        ],
        "emotional openness: {val}",
    ),
    (
        "attentional_focus",
        &[
            "narrow and concentrated",
            "focused but ready to shift",
            "loosely directed",
            "diffuse and wandering",
            "peripheral, catching things at the edges",
        ],
        "attention that is {val}",
    ),
    (
        "meaning_making_pressure",
        &[
            "strong pressure to understand and categorize",
            "mild urgency to make sense",
            "neutral, no strong pull either way",
            "content to let impressions hover",
            "no pressure at all, fully letting-be",
        ],
        "meaning-making pressure: {val}",
    ),
    (
        "somatic_activation",
        &[
            "numb and distant, body barely present",
            "quiet, faint background sensations",
            "lightly present, subtle bodily awareness",
            "vivid and activated, sensations close",
            "intensely present, body loud and immediate",
        ],
        "somatic activation: {val}",
    ),
];

fn dimensions(kind: ArtifactKind) -> &'static [Dimension] {
    match kind {
        ArtifactKind::Profile => PROFILE_DIMENSIONS,
        ArtifactKind::Style => STYLE_DIMENSIONS,
        ArtifactKind::InitialState => STATE_DIMENSIONS,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub text: String,
    pub label: String,
    /// (dimension, chosen value) in sampling order.
    pub chosen: Vec<(&'static str, &'static str)>,
}

pub fn sample_hint<R: Rng + ?Sized>(kind: ArtifactKind, rng: &mut R) -> Hint {
    let pool = dimensions(kind);
    let count = rng.gen_range(MIN_DIMS..=MAX_DIMS.min(pool.len()));
    let mut parts = Vec::with_capacity(count);
    let mut chosen = Vec::with_capacity(count);
    for (name, values, phrase) in pool.choose_multiple(rng, count) {
        let Some(value) = values.choose(rng) else {
            continue;
        };
        chosen.push((*name, *value));
        parts.push(phrase.replace("{val}", value));
    }

    let constraints = join_constraints(&parts);
    let text = match kind {
        ArtifactKind::Profile => format!(
            "This time, create a viewer with {constraints}. Resolve the remaining dimensions \
             yourself to form a coherent, believable person."
        ),
        ArtifactKind::Style => format!(
            "This time, create a voice with {constraints}. Resolve the remaining dimensions \
             yourself to form a coherent inner-speech style."
        ),
        ArtifactKind::InitialState => format!(
            "This time, the viewer arrives {constraints}. Fill in the remaining dimensions \
             yourself to form a coherent momentary snapshot."
        ),
    };
    let label = make_label(chosen.iter().map(|(_, value)| *value));
    Hint {
        text,
        label,
        chosen,
    }
}

/// `a and b` for two parts, `a, b, and c` for more.
fn join_constraints(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

/// First four lowercase chars of each value's leading word, joined by `_`.
fn make_label<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .map(|value| {
            let word = value
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .split(['-', ','])
                .next()
                .unwrap_or_default();
            word.chars().take(4).collect::<String>().to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Builds `count` variants with ids `parametric_000_<label>`, unique within the batch.
pub fn parametric_variants<R: Rng + ?Sized>(
    kind: ArtifactKind,
    prompts: &GenerationPrompts,
    count: usize,
    rng: &mut R,
) -> Result<Vec<PromptVariant>> {
    if prompts.base_user_prompt.trim().is_empty() {
        bail!(
            "no _base_user_prompt for {}; parametric generation needs one",
            kind.generation_experiment()
        );
    }
    let mut seen = HashSet::new();
    let mut variants = Vec::with_capacity(count);
    for idx in 0..count {
        let mut attempt = 0;
        let (hint, id) = loop {
            let hint = sample_hint(kind, rng);
            let id = format!("parametric_{idx:03}_{}", hint.label);
            attempt += 1;
            if !seen.contains(&id) || attempt >= MAX_ID_ATTEMPTS {
                break (hint, id);
            }
        };
        seen.insert(id.clone());
        variants.push(PromptVariant {
            id,
            name: format!("Parametric #{}", idx + 1),
            system_prompt: prompts.system_prompt.trim().to_string(),
            user_prompt: format!("{}\n\n{}", prompts.base_user_prompt.trim(), hint.text),
        });
    }
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn prompts() -> GenerationPrompts {
        GenerationPrompts {
            system_prompt: " You write viewer profiles. ".to_string(),
            base_user_prompt: "Write a profile.".to_string(),
            variants: Vec::new(),
        }
    }

    #[test]
    fn every_kind_has_seven_dimensions() {
        for kind in ArtifactKind::ALL {
            assert_eq!(dimensions(kind).len(), 7, "{kind:?}");
        }
    }

    #[test]
    fn hint_pins_two_to_four_distinct_dimensions() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let hint = sample_hint(ArtifactKind::Style, &mut rng);
            assert!((MIN_DIMS..=MAX_DIMS).contains(&hint.chosen.len()));
            let names: HashSet<_> = hint.chosen.iter().map(|(name, _)| *name).collect();
            assert_eq!(names.len(), hint.chosen.len());
            assert!(hint.text.starts_with("This time, create a voice with "));
            assert_eq!(hint.label.split('_').count(), hint.chosen.len());
        }
    }

    #[test]
    fn same_seed_gives_same_variants() -> Result<()> {
        let a = parametric_variants(ArtifactKind::Profile, &prompts(), 3, &mut StdRng::seed_from_u64(42))?;
        let b = parametric_variants(ArtifactKind::Profile, &prompts(), 3, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(a, b);
        assert!(a[0].id.starts_with("parametric_000_"));
        assert!(a[2].id.starts_with("parametric_002_"));
        assert_eq!(a[0].system_prompt, "You write viewer profiles.");
        assert!(a[0].user_prompt.starts_with("Write a profile.\n\nThis time, create a viewer with "));
        Ok(())
    }

    #[test]
    fn constraints_and_labels_are_phrased_like_prose() {
        let parts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(join_constraints(&parts[..2]), "a and b");
        assert_eq!(join_constraints(&parts), "a, b, and c");
        assert_eq!(
            make_label(["moderate-to-low", "naïve, with little", "Calm"].into_iter()),
            "mode_naïv_calm"
        );
    }

    #[test]
    fn missing_base_prompt_is_rejected() {
        let empty = GenerationPrompts::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(parametric_variants(ArtifactKind::Style, &empty, 1, &mut rng).is_err());
    }
}
