//! Reflection / state extraction from free-text model replies.
//!
//! Replies were produced by several prompt templates over time, so the
//! parser tries an ordered list of marker conventions, most specific first.
//! A convention only counts when both of its markers are present, in order.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// `[REFLECTION]` … `[STATE]` …
    Tagged,
    /// `Reflection:` … `State:` …
    Legacy,
    /// `Reaction:` … `Internal state after this image:` …
    Reaction,
    /// No marker pair; the whole reply is the reflection.
    Unstructured,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tagged => "tagged",
            Self::Legacy => "legacy",
            Self::Reaction => "reaction",
            Self::Unstructured => "unstructured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub reflection: String,
    pub state: String,
    pub format: ResponseFormat,
}

impl ParsedResponse {
    pub fn has_state(&self) -> bool {
        !self.state.is_empty()
    }
}

#[derive(Debug)]
pub struct MarkerMatcher {
    pub format: ResponseFormat,
    reflection: Regex,
    state: Regex,
}

impl MarkerMatcher {
    fn new(format: ResponseFormat, reflection: &str, state: &str) -> Self {
        Self {
            format,
            reflection: Regex::new(reflection).expect("reflection marker pattern is valid"),
            state: Regex::new(state).expect("state marker pattern is valid"),
        }
    }

    /// Returns (reflection, state) when both markers occur in order.
    pub fn try_match(&self, text: &str) -> Option<(String, String)> {
        let first = self.reflection.find(text)?;
        let second = self.state.find_at(text, first.end())?;
        let reflection = text[first.end()..second.start()].trim().to_string();
        let state = text[second.end()..].trim().to_string();
        Some((reflection, state))
    }
}

/// Optional `**` on either side of the marker and an optional colon.
const TAGGED_REFLECTION: &str = r"(?i)\*{0,2}\[reflection\]\*{0,2}:?\*{0,2}";
const TAGGED_STATE: &str = r"(?i)\*{0,2}\[state\]\*{0,2}:?\*{0,2}";
/// Colon-style markers only count at the start of a line, so prose such as
/// "my state: uneasy" inside a reflection is not taken as a marker.
const LEGACY_REFLECTION: &str = r"(?im)^[ \t]*\*{0,2}reflection\*{0,2}:\*{0,2}";
const LEGACY_STATE: &str = r"(?im)^[ \t]*\*{0,2}state\*{0,2}:\*{0,2}";
const REACTION: &str = r"(?im)^[ \t]*\*{0,2}reaction\*{0,2}:\*{0,2}";
const REACTION_STATE: &str =
    r"(?im)^[ \t]*\*{0,2}internal state after this image\*{0,2}:\*{0,2}";

pub fn response_matchers() -> &'static [MarkerMatcher] {
    static MATCHERS: OnceLock<Vec<MarkerMatcher>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        vec![
            MarkerMatcher::new(ResponseFormat::Tagged, TAGGED_REFLECTION, TAGGED_STATE),
            MarkerMatcher::new(ResponseFormat::Legacy, LEGACY_REFLECTION, LEGACY_STATE),
            MarkerMatcher::new(ResponseFormat::Reaction, REACTION, REACTION_STATE),
        ]
    })
}

/// Never fails: an empty `state` is the signal that no successor state was found.
pub fn parse_response(text: &str) -> ParsedResponse {
    for matcher in response_matchers() {
        if let Some((reflection, state)) = matcher.try_match(text) {
            return ParsedResponse {
                reflection,
                state,
                format: matcher.format,
            };
        }
    }
    ParsedResponse {
        reflection: text.trim().to_string(),
        state: String::new(),
        format: ResponseFormat::Unstructured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(format: ResponseFormat) -> &'static MarkerMatcher {
        response_matchers()
            .iter()
            .find(|matcher| matcher.format == format)
            .expect("matcher registered")
    }

    #[test]
    fn tagged_form_returns_text_between_markers() {
        let parsed = parse_response(
            "[REFLECTION]\n\nThe blue wall hums.\nIt stays with me.\n\n[STATE]\n\nrestless, alert",
        );
        assert_eq!(parsed.format, ResponseFormat::Tagged);
        assert_eq!(parsed.reflection, "The blue wall hums.\nIt stays with me.");
        assert_eq!(parsed.state, "restless, alert");
    }

    #[test]
    fn tagged_form_ignores_bold_colons_and_case() {
        let variants = [
            "**[REFLECTION]**\nquiet light\n**[STATE]**\nsettled",
            "[Reflection]: quiet light\n[State]: settled",
            "**[REFLECTION]:** quiet light **[STATE]:** settled",
            "[reflection]**: quiet light\n\n[state]**: settled",
        ];
        for text in variants {
            let parsed = parse_response(text);
            assert_eq!(parsed.format, ResponseFormat::Tagged, "{text}");
            assert_eq!(parsed.reflection, "quiet light", "{text}");
            assert_eq!(parsed.state, "settled", "{text}");
        }
    }

    #[test]
    fn legacy_form_is_used_when_tags_are_absent() {
        let text = "Reflection: the frame is too tight.\nState: guarded\nReaction: ignored";
        let parsed = parse_response(text);
        assert_eq!(parsed.format, ResponseFormat::Legacy);
        assert_eq!(parsed.reflection, "the frame is too tight.");
        assert_eq!(parsed.state, "guarded\nReaction: ignored");
    }

    #[test]
    fn oldest_form_is_parsed() {
        let text = "Reaction: a small gasp.\n\nInternal state after this image: softened";
        let parsed = parse_response(text);
        assert_eq!(parsed.format, ResponseFormat::Reaction);
        assert_eq!(parsed.reflection, "a small gasp.");
        assert_eq!(parsed.state, "softened");
    }

    #[test]
    fn partial_tagged_match_falls_through_to_legacy() {
        let text = "[REFLECTION] draft\nReflection: real one\nState: open";
        let parsed = parse_response(text);
        assert_eq!(parsed.format, ResponseFormat::Legacy);
        assert_eq!(parsed.reflection, "real one");
        assert_eq!(parsed.state, "open");
    }

    #[test]
    fn markers_out_of_order_do_not_match() {
        assert!(matcher(ResponseFormat::Tagged)
            .try_match("[STATE] calm [REFLECTION] later")
            .is_none());
    }

    #[test]
    fn text_without_markers_is_all_reflection() {
        let parsed = parse_response("  Just a paragraph about a painting.  ");
        assert_eq!(parsed.format, ResponseFormat::Unstructured);
        assert_eq!(parsed.reflection, "Just a paragraph about a painting.");
        assert_eq!(parsed.state, "");
        assert!(!parsed.has_state());
    }

    #[test]
    fn tagged_block_with_empty_state_is_still_tagged() {
        let parsed = parse_response("[REFLECTION]\n\nonly thoughts\n\n[STATE]\n\n   ");
        assert_eq!(parsed.format, ResponseFormat::Tagged);
        assert_eq!(parsed.reflection, "only thoughts");
        assert!(!parsed.has_state());
    }

    #[test]
    fn legacy_markers_need_word_boundaries() {
        assert!(matcher(ResponseFormat::Legacy)
            .try_match("Nonreflection: x\nRestate: y")
            .is_none());
    }

    #[test]
    fn legacy_state_word_inside_prose_is_not_a_marker() {
        let parsed =
            parse_response("Reflection: My emotional state: unsettled by the red.\nState: wary");
        assert_eq!(parsed.format, ResponseFormat::Legacy);
        assert_eq!(parsed.reflection, "My emotional state: unsettled by the red.");
        assert_eq!(parsed.state, "wary");
    }

    #[test]
    fn legacy_markers_on_one_line_fall_back_to_unstructured() {
        let parsed = parse_response("Reflection: loud. State: alarmed");
        assert_eq!(parsed.format, ResponseFormat::Unstructured);
        assert!(!parsed.has_state());
    }

    #[test]
    fn oldest_form_ignores_marker_words_mid_sentence() {
        let text = "Reaction: my internal state after this image: is hard to name.\n  **Internal state after this image:** numb";
        let parsed = parse_response(text);
        assert_eq!(parsed.format, ResponseFormat::Reaction);
        assert_eq!(parsed.reflection, "my internal state after this image: is hard to name.");
        assert_eq!(parsed.state, "numb");
    }

    #[test]
    fn matchers_are_ordered_by_specificity() {
        let order: Vec<ResponseFormat> = response_matchers().iter().map(|m| m.format).collect();
        assert_eq!(
            order,
            vec![
                ResponseFormat::Tagged,
                ResponseFormat::Legacy,
                ResponseFormat::Reaction
            ]
        );
    }
}
