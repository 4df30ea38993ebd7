use std::sync::OnceLock;

use regex::Regex;

/// Stored when a judge reply carries no recognizable score.
pub const SENTINEL_SCORE: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeVerdict {
    pub score: u8,
    pub rationale: String,
}

impl JudgeVerdict {
    pub fn is_unparsed(&self) -> bool {
        self.score == SENTINEL_SCORE
    }
}

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\*{0,2}SCORE:\*{0,2}\s*(\d)").expect("score pattern is valid")
    })
}

fn rationale_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)\*{0,2}RATIONALE:\*{0,2}\s*(.+)").expect("rationale pattern is valid")
    })
}

/// Reads `SCORE: <digit>` and `RATIONALE: <text>` out of a judge reply.
///
/// The first score digit wins and is clamped into 1..=5. Without a score
/// line the verdict carries the sentinel and the whole reply as rationale.
pub fn parse_judge_response(text: &str) -> JudgeVerdict {
    let digit = score_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok());

    let Some(digit) = digit else {
        return JudgeVerdict {
            score: SENTINEL_SCORE,
            rationale: text.trim().to_string(),
        };
    };

    let rationale = rationale_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| text.trim().to_string());

    JudgeVerdict {
        score: digit.clamp(1, 5),
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_score_and_multiline_rationale() {
        let verdict = parse_judge_response(
            "SCORE: 4\nRATIONALE: Reflects the prior image.\nStays in character.\n",
        );
        assert_eq!(verdict.score, 4);
        assert_eq!(
            verdict.rationale,
            "Reflects the prior image.\nStays in character."
        );
        assert!(!verdict.is_unparsed());
    }

    #[test]
    fn first_score_wins_and_is_clamped() {
        assert_eq!(parse_judge_response("SCORE: 0\nRATIONALE: x").score, 1);
        assert_eq!(parse_judge_response("SCORE: 9\nRATIONALE: x").score, 5);
        assert_eq!(parse_judge_response("SCORE:2 then SCORE: 5").score, 2);
    }

    #[test]
    fn tolerates_bold_labels() {
        let verdict = parse_judge_response("**SCORE:** 3\n**RATIONALE:** fine");
        assert_eq!(verdict.score, 3);
        assert_eq!(verdict.rationale, "fine");
    }

    #[test]
    fn missing_score_yields_sentinel_and_full_text() {
        let verdict = parse_judge_response("  I would rate this highly.  ");
        assert_eq!(verdict.score, SENTINEL_SCORE);
        assert_eq!(verdict.rationale, "I would rate this highly.");
        assert!(verdict.is_unparsed());
    }

    #[test]
    fn score_without_rationale_keeps_full_text() {
        let verdict = parse_judge_response("SCORE: 5");
        assert_eq!(verdict.score, 5);
        assert_eq!(verdict.rationale, "SCORE: 5");
    }
}
