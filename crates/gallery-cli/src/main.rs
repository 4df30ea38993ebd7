use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gallery_contracts::experiment::ArtifactKind;
use gallery_contracts::parsing::parse_response;
use gallery_contracts::runs::{ExperimentSummary, FsRunStore, RunRecord, RunStoreExt, Score};
use gallery_engine::providers::truncate_text;
use gallery_engine::reconstruct::compare_recorded_with_replay;
use gallery_engine::{
    freeze_artifacts, summarize_experiment, summarize_run, ArtifactOverride, GalleryRunner,
    JudgeOptions, WalkOptions,
};

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Parser)]
#[command(
    name = "gallery-eval",
    version,
    about = "Stateful gallery-walk evaluation for vision-language models"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk an experiment's images with every prompt variant.
    Walk(WalkArgs),
    /// Judge a finished run against the experiment's criteria.
    Evaluate(EvaluateArgs),
    /// Aggregate scores for one run or every run of an experiment.
    Summarize(SummarizeArgs),
    /// Print a run's artifacts, trajectory and per-image scores.
    Show(ShowArgs),
    /// Store a run's artifacts as the experiment's frozen artifacts.
    Freeze(FreezeArgs),
    /// Check that recorded prompts still match a fresh replay.
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
struct JudgeArgs {
    #[arg(long)]
    judge_provider: Option<String>,
    #[arg(long)]
    judge_model: Option<String>,
}

#[derive(Debug, Parser)]
struct WalkArgs {
    #[arg(long)]
    experiment: PathBuf,
    #[arg(long, env = "GALLERY_OUTPUT_DIR", default_value = "outputs")]
    out: PathBuf,
    /// Directory with `<kind>_generation/` templates (default: the experiment's parent).
    #[arg(long)]
    experiments_root: Option<PathBuf>,
    #[arg(long, short = 'p')]
    provider: Option<String>,
    #[arg(long, short = 'm')]
    model: Option<String>,
    /// Only walk these variant ids (repeatable).
    #[arg(long = "variant")]
    variants: Vec<String>,
    /// `results.json[:variant]` or a text file.
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    profile_text: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    style_text: Option<String>,
    #[arg(long)]
    initial_state: Option<String>,
    #[arg(long)]
    initial_state_text: Option<String>,
    /// Take profile, style and initial state from a previous run.
    #[arg(long, value_name = "RUN_DIR")]
    reuse_artifacts: Option<PathBuf>,
    /// Generate missing artifacts from a fixed template variant instead of parametric hints.
    #[arg(long)]
    fixed_variants: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Judge the run once the walk finishes.
    #[arg(long)]
    evaluate: bool,
    #[command(flatten)]
    judge: JudgeArgs,
    /// Print the run after it finishes.
    #[arg(long)]
    show: bool,
}

#[derive(Debug, Parser)]
struct EvaluateArgs {
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    experiment: PathBuf,
    #[command(flatten)]
    judge: JudgeArgs,
}

#[derive(Debug, Parser)]
struct SummarizeArgs {
    /// Summarize a single run directory.
    #[arg(long, conflicts_with = "experiment_id")]
    run: Option<PathBuf>,
    /// Summarize every run under `<out>/<experiment_id>`.
    #[arg(long, required_unless_present = "run")]
    experiment_id: Option<String>,
    #[arg(long, env = "GALLERY_OUTPUT_DIR", default_value = "outputs")]
    out: PathBuf,
    /// Only count scores from this judge (`provider/model`).
    #[arg(long)]
    judge_model: Option<String>,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    #[arg(long)]
    run: PathBuf,
}

#[derive(Debug, Parser)]
struct FreezeArgs {
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    experiment: PathBuf,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Parser)]
struct VerifyArgs {
    #[arg(long)]
    run: PathBuf,
}

fn main() {
    dotenvy::dotenv().ok();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gallery-eval error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Walk(args) => run_walk(args),
        Command::Evaluate(args) => run_evaluate(args),
        Command::Summarize(args) => run_summarize(args),
        Command::Show(args) => {
            show_run(&args.run)?;
            Ok(0)
        }
        Command::Freeze(args) => run_freeze(args),
        Command::Verify(args) => run_verify(args),
    }
}

fn artifact_override(reference: Option<String>, text: Option<String>) -> ArtifactOverride {
    ArtifactOverride { text, reference }
}

fn run_walk(args: WalkArgs) -> Result<i32> {
    let runner = GalleryRunner::default();
    let options = WalkOptions {
        experiment_dir: args.experiment.clone(),
        output_dir: args.out.clone(),
        experiments_root: args.experiments_root.clone(),
        provider: args.provider.clone(),
        model: args.model.clone(),
        variant_ids: args.variants.clone(),
        profile: artifact_override(args.profile.clone(), args.profile_text.clone()),
        style: artifact_override(args.style.clone(), args.style_text.clone()),
        initial_state: artifact_override(
            args.initial_state.clone(),
            args.initial_state_text.clone(),
        ),
        reuse_artifacts: args.reuse_artifacts.clone(),
        parametric: !args.fixed_variants,
        seed: args.seed,
        argv: env::args().collect(),
    };

    let walk = runner.walk(&options)?;
    if let Some(reason) = &walk.fallback_reason {
        eprintln!("Model: {} ({reason})", walk.model);
    } else {
        eprintln!("Model: {}", walk.model);
    }
    for provenance in &walk.artifacts.provenance {
        println!(
            "{}: {}{}",
            provenance.kind.label(),
            provenance.strategy,
            provenance
                .source
                .as_deref()
                .map(|source| format!(" ({source})"))
                .unwrap_or_default()
        );
    }
    for outcome in &walk.outcomes {
        println!(
            "Variant {}: {} steps, {} carried forward, final state: {}",
            outcome.variant_id,
            outcome.steps.len(),
            outcome.carried_forward(),
            preview(&outcome.final_state, 80)
        );
    }
    println!("Run saved to {}", walk.run_dir.display());

    if args.evaluate {
        evaluate_and_summarize(&runner, &walk.run_dir, &args.experiment, &args.judge)?;
    }
    if args.show {
        show_run(&walk.run_dir)?;
    }
    Ok(0)
}

fn run_evaluate(args: EvaluateArgs) -> Result<i32> {
    let runner = GalleryRunner::default();
    evaluate_and_summarize(&runner, &args.run, &args.experiment, &args.judge)?;
    Ok(0)
}

fn evaluate_and_summarize(
    runner: &GalleryRunner,
    run_dir: &Path,
    experiment_dir: &Path,
    judge: &JudgeArgs,
) -> Result<()> {
    let report = runner.evaluate(
        run_dir,
        &JudgeOptions {
            experiment_dir: experiment_dir.to_path_buf(),
            provider: judge.judge_provider.clone(),
            model: judge.judge_model.clone(),
        },
    )?;
    println!(
        "Judged with {}: {} scores, {} unparsed (prompt context: {})",
        report.judge_model,
        report.scores,
        report.unparsed,
        report.fidelity.as_str()
    );
    let summary = summarize_run(run_dir, Some(&report.judge_model))?;
    print_summary(&summary);
    Ok(())
}

fn run_summarize(args: SummarizeArgs) -> Result<i32> {
    let judge = args.judge_model.as_deref();
    let summary = match (&args.run, &args.experiment_id) {
        (Some(run_dir), _) => summarize_run(run_dir, judge)?,
        (None, Some(experiment_id)) => summarize_experiment(&args.out, experiment_id, judge)?,
        (None, None) => anyhow::bail!("pass --run or --experiment-id"),
    };
    print_summary(&summary);
    Ok(0)
}

fn run_freeze(args: FreezeArgs) -> Result<i32> {
    let written = freeze_artifacts(
        &args.run,
        &args.experiment,
        args.description.as_deref(),
        args.force,
    )?;
    for path in &written {
        println!("  wrote {}", path.display());
    }
    println!(
        "Frozen artifacts -> {}",
        args.experiment.join("artifacts").display()
    );
    Ok(0)
}

fn run_verify(args: VerifyArgs) -> Result<i32> {
    let store = FsRunStore::open(&args.run)?;
    let record = store.load_record()?;
    let comparison = compare_recorded_with_replay(&record)?;
    match &comparison.first_mismatch {
        None => {
            println!(
                "OK: {} recorded prompts match their replay.",
                comparison.steps_compared
            );
            Ok(0)
        }
        Some(mismatch) => {
            println!(
                "Mismatch at result {} (variant {}, image {}):",
                mismatch.result_id, mismatch.prompt_variant_id, mismatch.image_id
            );
            print!("{}", mismatch.diff);
            Ok(2)
        }
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn print_summary(summary: &ExperimentSummary) {
    print_lines(&summary_lines(summary));
}

fn summary_lines(summary: &ExperimentSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "\nSummary for {} ({} run{})",
        summary.experiment_id,
        summary.num_runs,
        if summary.num_runs == 1 { "" } else { "s" }
    )];
    if let Some(judge) = &summary.judge_model {
        lines.push(format!("Judge: {judge}"));
    }
    if summary.unparsed > 0 {
        lines.push(format!("Unparsed judge replies: {}", summary.unparsed));
    }
    if summary.variants.is_empty() {
        lines.push("No scores yet.".to_string());
        return lines;
    }
    for variant in &summary.variants {
        lines.push(format!("\n  {variant}"));
        for criterion in &summary.criteria {
            let Some(stats) = summary.stats(variant, criterion) else {
                continue;
            };
            let mean = stats
                .mean
                .map(|value| format!("{value:.2}"))
                .unwrap_or_else(|| "-".to_string());
            let range = match (stats.min, stats.max) {
                (Some(min), Some(max)) => format!("{min}-{max}"),
                _ => "-".to_string(),
            };
            let mut line = format!(
                "    {criterion:<24} mean {mean:>5}  range {range:>3}  n={}",
                stats.count
            );
            if stats.unparsed > 0 {
                line.push_str(&format!("  unparsed={}", stats.unparsed));
            }
            if stats.low_confidence > 0 {
                line.push_str(&format!("  low_confidence={}", stats.low_confidence));
            }
            lines.push(line);
        }
    }
    lines
}

fn show_run(run_dir: &Path) -> Result<()> {
    let store = FsRunStore::open(run_dir)?;
    let record = store
        .load_record()
        .with_context(|| format!("failed to load run {}", run_dir.display()))?;
    let scores = store.load_scores()?;

    println!(
        "Run {} ({}/{})",
        record.name, record.config.provider, record.config.model
    );
    if let Some(artifacts) = &record.artifacts {
        for kind in ArtifactKind::ALL {
            let limit = match kind {
                ArtifactKind::InitialState => usize::MAX,
                _ => PREVIEW_CHARS,
            };
            println!("{}: {}", kind.label(), preview(artifacts.get(kind), limit));
        }
    }
    print_lines(&trajectory_lines(&record));
    print_lines(&image_score_lines(&record, &scores));
    Ok(())
}

fn trajectory_lines(record: &RunRecord) -> Vec<String> {
    let mut variant_ids: Vec<&str> = Vec::new();
    for result in &record.results {
        if !variant_ids.contains(&result.prompt_variant_id.as_str()) {
            variant_ids.push(result.prompt_variant_id.as_str());
        }
    }
    let mut lines = Vec::new();
    for variant_id in variant_ids {
        lines.push(format!("\n== {variant_id} =="));
        let steps = record
            .results
            .iter()
            .filter(|result| result.prompt_variant_id == variant_id);
        for (idx, result) in steps.enumerate() {
            let parsed = parse_response(&result.raw_response);
            let tokens = match (
                result.token_usage.prompt_tokens,
                result.token_usage.completion_tokens,
            ) {
                (Some(prompt), Some(completion)) => format!(", tokens {prompt}/{completion}"),
                _ => String::new(),
            };
            lines.push(format!(
                "\n[{}] {} ({} ms{tokens})",
                idx + 1,
                result.image_id,
                result.latency_ms
            ));
            lines.push(format!(
                "  reflection: {}",
                preview(&parsed.reflection, PREVIEW_CHARS)
            ));
            if parsed.has_state() {
                lines.push(format!("  state: {}", parsed.state));
            } else {
                lines.push("  state: (none; previous state carried forward)".to_string());
            }
        }
    }
    lines
}

/// Per-image mean of parsed scores, one column per criterion, in configured image order.
fn image_score_lines(record: &RunRecord, scores: &[Score]) -> Vec<String> {
    let image_of: BTreeMap<&str, &str> = record
        .results
        .iter()
        .map(|result| (result.id.as_str(), result.image_id.as_str()))
        .collect();
    let mut table: BTreeMap<&str, BTreeMap<&str, Vec<u8>>> = BTreeMap::new();
    let mut criteria: Vec<&str> = Vec::new();
    for score in scores.iter().filter(|score| !score.is_sentinel()) {
        let Some(&image_id) = image_of.get(score.run_result_id.as_str()) else {
            continue;
        };
        if !criteria.contains(&score.criterion_id.as_str()) {
            criteria.push(score.criterion_id.as_str());
        }
        table
            .entry(image_id)
            .or_default()
            .entry(score.criterion_id.as_str())
            .or_default()
            .push(score.score);
    }
    if table.is_empty() {
        return Vec::new();
    }
    criteria.sort();

    let mut header = format!("  {:<16}", "image");
    for criterion in &criteria {
        header.push_str(&format!(" {criterion:>14}"));
    }
    let mut lines = vec!["\nMean score per image:".to_string(), header];
    for image in &record.config.images {
        let Some(row) = table.get(image.id.as_str()) else {
            continue;
        };
        let mut line = format!("  {:<16}", image.id);
        for criterion in &criteria {
            let cell = row
                .get(criterion)
                .filter(|values| !values.is_empty())
                .map(|values| {
                    let sum: u32 = values.iter().map(|value| u32::from(*value)).sum();
                    format!("{:.2}", f64::from(sum) / values.len() as f64)
                })
                .unwrap_or_else(|| "-".to_string());
            line.push_str(&format!(" {cell:>14}"));
        }
        lines.push(line);
    }
    lines
}

fn preview(text: &str, max_chars: usize) -> String {
    truncate_text(text.trim(), max_chars)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use gallery_contracts::experiment::{ExperimentConfig, ImageInput};
    use gallery_contracts::runs::{aggregate, PromptFidelity, RunKey, RunResult, RunScores};
    use serde_json::json;

    use super::*;

    fn image(id: &str) -> ImageInput {
        ImageInput {
            id: id.to_string(),
            source: format!("{id}.png"),
            caption: None,
        }
    }

    fn result(id: &str, image_id: &str, reply: &str) -> RunResult {
        let mut result = RunResult::new("reflection", image_id, "dryrun", "m", reply.to_string());
        result.id = id.to_string();
        result
    }

    fn score(result_id: &str, criterion: &str, value: u8) -> Score {
        Score::from_judge(result_id, criterion, value, String::new(), "dryrun/m", PromptFidelity::Exact)
    }

    fn record(results: Vec<RunResult>) -> RunRecord {
        let mut config = ExperimentConfig::new("exp", "dryrun", "m");
        config.images = vec![image("a"), image("b")];
        RunRecord {
            name: "run-1".to_string(),
            config,
            variants: Vec::new(),
            artifacts: None,
            results,
            assembled: Vec::new(),
        }
    }

    #[test]
    fn image_means_skip_unparsed_scores() {
        let record = record(vec![result("r-a", "a", ""), result("r-b", "b", "")]);
        let scores = vec![
            score("r-a", "grounding", 4),
            score("r-a", "grounding", 0),
            score("r-a", "grounding", 3),
            score("r-b", "grounding", 0),
            score("r-b", "adherence", 5),
        ];
        let lines = image_score_lines(&record, &scores);

        assert_eq!(lines[0], "\nMean score per image:");
        assert!(lines[1].contains("adherence") && lines[1].contains("grounding"));
        let row_a = lines.iter().find(|line| line.trim_start().starts_with("a ")).cloned();
        let row_b = lines.iter().find(|line| line.trim_start().starts_with("b ")).cloned();
        let row_a = row_a.unwrap_or_default();
        assert!(row_a.ends_with("3.50"), "{row_a}");
        assert!(row_a.contains(" - "), "{row_a}");
        let row_b = row_b.unwrap_or_default();
        assert!(row_b.contains("5.00"), "{row_b}");
        assert!(row_b.ends_with("-"), "{row_b}");
    }

    #[test]
    fn image_table_is_empty_without_parsed_scores() {
        let record = record(vec![result("r-a", "a", "")]);
        assert!(image_score_lines(&record, &[score("r-a", "grounding", 0)]).is_empty());
    }

    #[test]
    fn trajectory_marks_carried_forward_steps() {
        let record = record(vec![
            result("r-a", "a", "[REFLECTION]\n\nbright\n\n[STATE]\n\nrestless"),
            result("r-b", "b", "no markers here"),
        ]);
        let lines = trajectory_lines(&record);
        assert_eq!(lines[0], "\n== reflection ==");
        assert!(lines.contains(&"  state: restless".to_string()));
        assert!(lines.contains(&"  state: (none; previous state carried forward)".to_string()));
        assert!(lines.contains(&"  reflection: no markers here".to_string()));
    }

    #[test]
    fn summary_lines_flag_unparsed_and_low_confidence() {
        let mut degraded = score("r-a", "grounding", 2);
        degraded.prompt_fidelity = Some(PromptFidelity::Degraded);
        let run = RunScores {
            run: "run-1".to_string(),
            provider: "dryrun".to_string(),
            model: "m".to_string(),
            results: vec![result("r-a", "a", "")],
            scores: vec![degraded, score("r-a", "grounding", 4), score("r-a", "grounding", 0)],
        };
        let lines = summary_lines(&aggregate("exp", &[run], Some("dryrun/m")));

        assert_eq!(lines[0], "\nSummary for exp (1 run)");
        assert_eq!(lines[1], "Judge: dryrun/m");
        assert_eq!(lines[2], "Unparsed judge replies: 1");
        let row = lines.last().cloned().unwrap_or_default();
        assert!(row.contains("mean  3.00"), "{row}");
        assert!(row.contains("range 2-4"), "{row}");
        assert!(row.contains("n=2  unparsed=1  low_confidence=1"), "{row}");
    }

    #[test]
    fn summary_without_scores_says_so() {
        let lines = summary_lines(&aggregate("exp", &[], None));
        assert_eq!(lines.last().map(String::as_str), Some("No scores yet."));
    }

    #[test]
    fn preview_trims_and_cuts() {
        assert_eq!(preview("  short  ", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc…");
    }

    fn walked_run(root: &Path) -> Result<PathBuf> {
        let dir = root.join("experiments").join("verify_test");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("a.png"), [0x89u8, 0x50, 0x4e, 0x47])?;
        fs::write(dir.join("b.png"), [0x89u8, 0x50, 0x4e, 0x47])?;
        let config = json!({
            "experiment_id": "verify_test",
            "provider": "dryrun",
            "images": [{"id": "a", "source": "a.png"}, {"id": "b", "source": "b.png"}]
        });
        fs::write(dir.join("config.json"), serde_json::to_string(&config)?)?;
        let prompts = json!({
            "system_prompt": "You walk a gallery.",
            "user_prompt_template": "{profile} {style} Now: {current_state}"
        });
        fs::write(dir.join("prompts.json"), serde_json::to_string(&prompts)?)?;

        let text = |value: &str| ArtifactOverride {
            text: Some(value.to_string()),
            reference: None,
        };
        let run = GalleryRunner::default().walk(&WalkOptions {
            experiment_dir: dir,
            output_dir: root.join("out"),
            profile: text("A painter."),
            style: text("Plain."),
            initial_state: text("calm"),
            ..WalkOptions::default()
        })?;
        Ok(run.run_dir)
    }

    #[test]
    fn verify_passes_on_an_untouched_run() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let run_dir = walked_run(temp.path())?;
        assert_eq!(run_verify(VerifyArgs { run: run_dir })?, 0);
        Ok(())
    }

    #[test]
    fn verify_exits_2_when_the_template_changed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let run_dir = walked_run(temp.path())?;
        let store = FsRunStore::open(&run_dir)?;
        let mut variants = store.load_variants()?;
        variants[0].user_prompt = "{profile} {style} Feeling: {current_state}".to_string();
        store.put(RunKey::Variants, &variants)?;

        assert_eq!(run_verify(VerifyArgs { run: run_dir })?, 2);
        Ok(())
    }
}
