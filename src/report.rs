use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use tracing::info;

use crate::config::HarnessConfig;
use crate::dataset::read_json_or_jsonl;
use crate::sample::Sample;
use crate::scoring::{EvalStatus, QuestionKind, score_sample};

#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// Path to the harness config file.
    #[arg(long, default_value = "config/bio-eval.toml")]
    pub config_file: PathBuf,

    /// Directory of inference output files to score. Every `.jsonl` file in it
    /// is scored unless explicit files are given.
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Explicit output files to score instead of scanning `--results-dir`.
    #[arg(long)]
    pub files: Vec<PathBuf>,

    /// Where to write annotated copies of the scored files. No annotated
    /// output is produced when unset.
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
}

/// Running tally of grading outcomes for one group of records.
#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    total: usize,
    correct: usize,
    incorrect: usize,
    miss: usize,
    error: usize,
    real_life: usize,
    pass_rate_sum: f64,
    pass_rate_count: usize,
}

impl Tally {
    fn record(&mut self, outcome: &crate::scoring::ScoreOutcome) {
        self.total += 1;
        match outcome.status {
            EvalStatus::Correct => self.correct += 1,
            EvalStatus::Incorrect => self.incorrect += 1,
            EvalStatus::Miss => self.miss += 1,
            EvalStatus::Error => self.error += 1,
        }
        if outcome.is_real_life == Some(true) {
            self.real_life += 1;
        }
        if let Some(pass_rate) = outcome.pass_rate {
            self.pass_rate_sum += pass_rate;
            self.pass_rate_count += 1;
        }
    }

    fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn mean_pass_rate(&self) -> Option<f64> {
        if self.pass_rate_count == 0 {
            None
        } else {
            Some(self.pass_rate_sum / self.pass_rate_count as f64)
        }
    }
}

/// Infers the grading kind from an output file name of the form
/// `{model}_{split}_{mode}.jsonl` by testing each underscore-separated
/// segment as a split name.
fn kind_for_file(path: &Path) -> QuestionKind {
    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return QuestionKind::Standard;
    };
    stem.split('_')
        .map(QuestionKind::from_split)
        .find(|kind| *kind != QuestionKind::Standard)
        .unwrap_or(QuestionKind::Standard)
}

/// The category path a record rolls up under in the breakdown table.
fn category_path(sample: &Sample) -> String {
    ["overview_category", "category", "subcategory"]
        .into_iter()
        .filter_map(|key| sample.get(key).and_then(serde_json::Value::as_str))
        .collect::<Vec<_>>()
        .join(" / ")
}

fn collect_files(args: &ScoreArgs) -> Result<Vec<PathBuf>> {
    if !args.files.is_empty() {
        return Ok(args.files.clone());
    }
    let mut files = Vec::new();
    let entries = std::fs::read_dir(&args.results_dir)
        .with_context(|| format!("failed to read {}", args.results_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        bail!("no .jsonl files found in {}", args.results_dir.display());
    }
    Ok(files)
}

fn score_file(
    path: &Path,
    config: &HarnessConfig,
    save_dir: Option<&Path>,
) -> Result<(Tally, BTreeMap<String, Tally>)> {
    let kind = kind_for_file(path);
    let samples = read_json_or_jsonl(path)?;
    let mut tally = Tally::default();
    let mut by_category: BTreeMap<String, Tally> = BTreeMap::new();
    let mut annotated = Vec::with_capacity(samples.len());
    for mut sample in samples {
        let outcome = score_sample(&sample, &config.keys, kind);
        tally.record(&outcome);
        let category = category_path(&sample);
        if !category.is_empty() {
            by_category.entry(category).or_default().record(&outcome);
        }
        if save_dir.is_some() {
            sample.insert(
                "extracted_answer",
                match outcome.predicted {
                    Some(letter) => json!(letter.to_string()),
                    None => json!(null),
                },
            );
            sample.insert("eval_status", serde_json::to_value(outcome.status)?);
            if let Some(is_real_life) = outcome.is_real_life {
                sample.insert("is_real_life", json!(is_real_life));
            }
            if let Some(pass_rate) = outcome.pass_rate {
                sample.insert("pass_rate", json!(pass_rate));
            }
            annotated.push(sample);
        }
    }
    if let Some(save_dir) = save_dir {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("failed to create {}", save_dir.display()))?;
        let file_name = path
            .file_name()
            .context("scored file has no file name")?;
        let out_path = save_dir.join(file_name);
        let mut out = std::io::BufWriter::new(std::fs::File::create(&out_path)?);
        for sample in &annotated {
            writeln!(out, "{}", serde_json::to_string(sample)?)?;
        }
        info!(path = %out_path.display(), "wrote annotated records");
    }
    Ok((tally, by_category))
}

fn write_tally_row(
    writer: &mut impl Write,
    label: &str,
    tally: &Tally,
) -> Result<()> {
    write!(
        writer,
        "{label}\n  n={} accuracy={:.3} correct={} incorrect={} miss={} error={}",
        tally.total, tally.accuracy(), tally.correct, tally.incorrect, tally.miss, tally.error
    )?;
    if tally.real_life > 0 {
        write!(writer, " real_life={}", tally.real_life)?;
    }
    if let Some(pass_rate) = tally.mean_pass_rate() {
        write!(writer, " mean_pass_rate={pass_rate:.3}")?;
    }
    writeln!(writer)?;
    Ok(())
}

pub fn run_score(args: &ScoreArgs, writer: &mut impl Write) -> Result<()> {
    let config = if args.config_file.exists() {
        HarnessConfig::load(&args.config_file)?
    } else {
        HarnessConfig::default()
    };
    let files = collect_files(args)?;
    for path in &files {
        let (tally, by_category) = score_file(path, &config, args.save_dir.as_deref())?;
        write_tally_row(writer, &path.display().to_string(), &tally)?;
        for (category, tally) in &by_category {
            write_tally_row(writer, &format!("  {category}"), tally)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}
