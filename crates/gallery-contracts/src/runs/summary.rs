use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::records::{now_utc_iso, PromptFidelity, RunResult, Score};

/// Variant used for scores whose result id is not in the run's results.
pub const UNKNOWN_VARIANT: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub mean: Option<f64>,
    pub min: Option<u8>,
    pub max: Option<u8>,
    pub count: u64,
    #[serde(default)]
    pub unparsed: u64,
    #[serde(default)]
    pub low_confidence: u64,
}

impl ScoreStats {
    fn from_values(values: &[u8], unparsed: u64, low_confidence: u64) -> Self {
        if values.is_empty() {
            return Self {
                unparsed,
                low_confidence,
                ..Self::default()
            };
        }
        let sum: u64 = values.iter().map(|value| u64::from(*value)).sum();
        let mean = sum as f64 / values.len() as f64;
        Self {
            mean: Some(round_half_even_2dp(mean)),
            min: values.iter().min().copied(),
            max: values.iter().max().copied(),
            count: values.len() as u64,
            unparsed,
            low_confidence,
        }
    }
}

/// Two decimal places, ties to even (2.125 -> 2.12, 2.135 -> 2.14).
fn round_half_even_2dp(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run: String,
    pub num_results: u64,
    pub provider: String,
    pub model: String,
    pub num_scores: u64,
}

/// Everything the aggregator needs from one run.
#[derive(Debug, Clone)]
pub struct RunScores {
    pub run: String,
    pub provider: String,
    pub model: String,
    pub results: Vec<RunResult>,
    pub scores: Vec<Score>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub num_runs: u64,
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    /// Sentinel scores across every pair, including pairs with no parsed score.
    #[serde(default)]
    pub unparsed: u64,
    pub runs: Vec<RunInfo>,
    pub variants: Vec<String>,
    pub criteria: Vec<String>,
    /// variant id -> criterion id -> stats
    pub scores: BTreeMap<String, BTreeMap<String, ScoreStats>>,
}

impl ExperimentSummary {
    pub fn stats(&self, variant_id: &str, criterion_id: &str) -> Option<&ScoreStats> {
        self.scores.get(variant_id)?.get(criterion_id)
    }
}

#[derive(Default)]
struct Bucket {
    values: Vec<u8>,
    unparsed: u64,
    low_confidence: u64,
}

/// Groups scores by (variant, criterion) across all runs.
///
/// Sentinel scores never enter mean/min/max/count; they are counted as
/// `unparsed`. With `judge_model` set, other judges' scores are ignored.
pub fn aggregate(
    experiment_id: &str,
    runs: &[RunScores],
    judge_model: Option<&str>,
) -> ExperimentSummary {
    let mut buckets: BTreeMap<(String, String), Bucket> = BTreeMap::new();
    let mut infos = Vec::with_capacity(runs.len());

    for run in runs {
        let variant_of: HashMap<&str, &str> = run
            .results
            .iter()
            .map(|result| (result.id.as_str(), result.prompt_variant_id.as_str()))
            .collect();

        let mut counted = 0u64;
        for score in &run.scores {
            if judge_model.is_some_and(|judge| judge != score.judge_model) {
                continue;
            }
            counted += 1;
            let variant = variant_of
                .get(score.run_result_id.as_str())
                .copied()
                .unwrap_or(UNKNOWN_VARIANT);
            let bucket = buckets
                .entry((variant.to_string(), score.criterion_id.clone()))
                .or_default();
            if score.is_sentinel() {
                bucket.unparsed += 1;
                continue;
            }
            bucket.values.push(score.score);
            if score.prompt_fidelity == Some(PromptFidelity::Degraded) {
                bucket.low_confidence += 1;
            }
        }

        infos.push(RunInfo {
            run: run.run.clone(),
            num_results: run.results.len() as u64,
            provider: run.provider.clone(),
            model: run.model.clone(),
            num_scores: counted,
        });
    }

    let unparsed = buckets.values().map(|bucket| bucket.unparsed).sum();
    // Axes only name pairs with at least one parsed score; sentinel-only
    // pairs still count towards `unparsed`.
    let scored = buckets.iter().filter(|(_, bucket)| !bucket.values.is_empty());
    let variants: BTreeSet<String> = scored.clone().map(|((variant, _), _)| variant.clone()).collect();
    let criteria: BTreeSet<String> = scored.map(|((_, criterion), _)| criterion.clone()).collect();

    let mut scores = BTreeMap::new();
    for variant in &variants {
        let mut row = BTreeMap::new();
        for criterion in &criteria {
            let stats = buckets
                .get(&(variant.clone(), criterion.clone()))
                .map(|bucket| {
                    ScoreStats::from_values(&bucket.values, bucket.unparsed, bucket.low_confidence)
                })
                .unwrap_or_default();
            row.insert(criterion.clone(), stats);
        }
        scores.insert(variant.clone(), row);
    }

    ExperimentSummary {
        experiment_id: experiment_id.to_string(),
        num_runs: runs.len() as u64,
        generated_at: now_utc_iso(),
        judge_model: judge_model.map(str::to_string),
        unparsed,
        runs: infos,
        variants: variants.into_iter().collect(),
        criteria: criteria.into_iter().collect(),
        scores,
    }
}

pub fn write_summary(path: &Path, summary: &ExperimentSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn result(id: &str, variant: &str) -> RunResult {
        let mut result = RunResult::new(variant, "img", "dryrun", "m", String::new());
        result.id = id.to_string();
        result
    }

    fn score(result_id: &str, criterion: &str, value: u8, judge: &str) -> Score {
        Score::from_judge(result_id, criterion, value, String::new(), judge, PromptFidelity::Exact)
    }

    fn run(name: &str, results: Vec<RunResult>, scores: Vec<Score>) -> RunScores {
        RunScores {
            run: name.to_string(),
            provider: "dryrun".to_string(),
            model: "m".to_string(),
            results,
            scores,
        }
    }

    #[test]
    fn sentinels_are_excluded_from_statistics() {
        let scores = [3, 0, 5, 0, 4]
            .iter()
            .map(|value| score("r-1", "coherence", *value, "j"))
            .collect();
        let summary = aggregate("exp", &[run("a", vec![result("r-1", "v1")], scores)], None);

        let stats = summary.stats("v1", "coherence").cloned().unwrap_or_default();
        assert_eq!(stats.mean, Some(4.0));
        assert_eq!(stats.min, Some(3));
        assert_eq!(stats.max, Some(5));
        assert_eq!(stats.count, 3);
        assert_eq!(stats.unparsed, 2);
    }

    #[test]
    fn runs_share_one_grouping_and_axes_are_sorted() {
        let first = run(
            "2026-01-01T00-00-00",
            vec![result("a1", "zeta"), result("a2", "alpha")],
            vec![score("a1", "tone", 2, "j"), score("a2", "coherence", 5, "j")],
        );
        let second = run(
            "2026-01-02T00-00-00",
            vec![result("b1", "zeta")],
            vec![score("b1", "tone", 3, "j"), score("missing", "tone", 1, "j")],
        );
        let summary = aggregate("exp", &[first, second], None);

        assert_eq!(summary.num_runs, 2);
        assert_eq!(summary.variants, vec!["alpha", "unknown", "zeta"]);
        assert_eq!(summary.criteria, vec!["coherence", "tone"]);
        assert_eq!(summary.stats("zeta", "tone").map(|s| s.mean), Some(Some(2.5)));
        assert_eq!(summary.stats("zeta", "tone").map(|s| s.count), Some(2));
        assert_eq!(summary.stats("alpha", "tone").map(|s| s.count), Some(0));
        assert_eq!(summary.stats("alpha", "tone").and_then(|s| s.mean), None);
        assert_eq!(summary.runs[1].num_scores, 2);
    }

    #[test]
    fn mean_is_rounded_to_two_decimals() {
        let scores = vec![score("r", "c", 1, "j"), score("r", "c", 2, "j"), score("r", "c", 2, "j")];
        let summary = aggregate("exp", &[run("a", vec![result("r", "v")], scores)], None);
        assert_eq!(summary.stats("v", "c").and_then(|s| s.mean), Some(1.67));
    }

    #[test]
    fn sentinel_only_pairs_stay_off_the_axes() {
        let scores = vec![
            score("r1", "coherence", 3, "j"),
            score("r1", "tone", 0, "j"),
            score("r2", "tone", 0, "j"),
        ];
        let results = vec![result("r1", "v1"), result("r2", "v2")];
        let summary = aggregate("exp", &[run("a", results, scores)], None);

        assert_eq!(summary.variants, vec!["v1"]);
        assert_eq!(summary.criteria, vec!["coherence"]);
        assert!(summary.stats("v1", "tone").is_none());
        assert!(summary.stats("v2", "tone").is_none());
        assert_eq!(summary.unparsed, 2);
    }

    #[test]
    fn mean_ties_round_to_even() {
        let mut scores = vec![score("r", "c", 2, "j"); 7];
        scores.push(score("r", "c", 3, "j"));
        let summary = aggregate("exp", &[run("a", vec![result("r", "v")], scores)], None);
        assert_eq!(summary.stats("v", "c").and_then(|s| s.mean), Some(2.12));

        assert_eq!(round_half_even_2dp(2.375), 2.38);
        assert_eq!(round_half_even_2dp(3.5), 3.5);
    }

    #[test]
    fn judge_filter_and_low_confidence_flags() {
        let mut degraded = score("r", "c", 4, "judge-a");
        degraded.prompt_fidelity = Some(PromptFidelity::Degraded);
        let scores = vec![degraded, score("r", "c", 2, "judge-a"), score("r", "c", 5, "judge-b")];
        let summary = aggregate("exp", &[run("a", vec![result("r", "v")], scores)], Some("judge-a"));

        let stats = summary.stats("v", "c").cloned().unwrap_or_default();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, Some(3.0));
        assert_eq!(stats.low_confidence, 1);
        assert_eq!(summary.runs[0].num_scores, 2);
        assert_eq!(summary.judge_model.as_deref(), Some("judge-a"));
    }

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("summary.json");
        let scores = vec![score("r", "c", 4, "j"), score("r", "c", 0, "j")];
        let summary = aggregate("exp", &[run("a", vec![result("r", "v")], scores)], None);
        write_summary(&path, &summary)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["experiment_id"], json!("exp"));
        assert_eq!(parsed["scores"]["v"]["c"]["mean"], json!(4.0));
        assert_eq!(parsed["scores"]["v"]["c"]["count"], json!(1));
        assert_eq!(parsed["scores"]["v"]["c"]["unparsed"], json!(1));
        assert_eq!(parsed["unparsed"], json!(1));
        assert_eq!(parsed["runs"][0]["run"], json!("a"));
        assert!(parsed.get("judge_model").is_none());
        Ok(())
    }
}
