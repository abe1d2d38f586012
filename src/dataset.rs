use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{HarnessConfig, Templates};
use crate::sample::Sample;

/// Interaction mode for a run. Selects both the initial prompt shape and the
/// post-processor driving the multi-round loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    #[value(name = "zero-shot")]
    ZeroShot,
    #[value(name = "self-correction")]
    SelfCorrection,
    #[value(name = "self-correction-with-needle")]
    SelfCorrectionWithNeedle,
    #[value(name = "gen_confusion_options")]
    OptionGeneration,
}

impl Mode {
    /// The mode's name as used in output file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::ZeroShot => "zero-shot",
            Mode::SelfCorrection => "self-correction",
            Mode::SelfCorrectionWithNeedle => "self-correction-with-needle",
            Mode::OptionGeneration => "gen_confusion_options",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves `{data_dir}/{split}.json` or `.jsonl`, whichever exists.
fn split_path(data_dir: &Path, split: &str) -> Result<PathBuf> {
    let json = data_dir.join(format!("{split}.json"));
    if json.exists() {
        return Ok(json);
    }
    let jsonl = data_dir.join(format!("{split}.jsonl"));
    if jsonl.exists() {
        return Ok(jsonl);
    }
    Err(anyhow!(
        "no JSON or JSONL file for split '{split}' in {}",
        data_dir.display()
    ))
}

/// Reads a dataset file into samples. `.json` files hold a top-level array,
/// `.jsonl` files one object per line.
pub fn read_json_or_jsonl(path: &Path) -> Result<Vec<Sample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        let values: Vec<Value> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        values
            .into_iter()
            .map(|value| {
                serde_json::from_value(value)
                    .with_context(|| format!("non-object record in {}", path.display()))
            })
            .collect()
    } else {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("corrupt record in {}", path.display()))
            })
            .collect()
    }
}

/// Renders the lettered question block: question text followed by one
/// `X) option` line per option.
pub fn question_block(sample: &Sample) -> Result<String> {
    let question = sample
        .get("question")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("sample is missing a 'question' field"))?;
    let options = sample
        .options()
        .ok_or_else(|| anyhow!("sample is missing an 'options' field"))?;
    let mut block = question.to_string();
    for (index, option) in options.iter().enumerate() {
        let letter = (b'A' + index as u8) as char;
        block.push_str(&format!("\n{letter}) {option}"));
    }
    Ok(block)
}

/// Loads the data source for one (split, mode) pair and attaches the initial
/// prompt to each sample. Returns (prompt, sample) pairs in dataset order;
/// ordering is what the sharding partition is computed against.
pub fn load_data(
    config: &HarnessConfig,
    templates: &Templates,
    split: &str,
    mode: Mode,
) -> Result<Vec<(String, Sample)>> {
    let path = split_path(&config.data_dir, split)?;
    debug!(path = %path.display(), "loading data source");
    let samples = read_json_or_jsonl(&path)?;
    let mut pairs = Vec::with_capacity(samples.len());
    for sample in samples {
        let prompt = match mode {
            // Self-correction starts from the plain zero-shot prompt; the
            // follow-up template only applies to later rounds.
            Mode::ZeroShot | Mode::SelfCorrection | Mode::SelfCorrectionWithNeedle => {
                templates.render_zero_shot(&question_block(&sample)?)?
            }
            Mode::OptionGeneration => {
                let question = sample
                    .get("question")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("sample is missing a 'question' field"))?;
                let options = sample
                    .options()
                    .ok_or_else(|| anyhow!("sample is missing an 'options' field"))?;
                let answer = sample
                    .answer()
                    .ok_or_else(|| anyhow!("sample is missing an 'answer' field"))?;
                let block = format!("{question}\n{}", options.join("\n"));
                templates.render_option_generation(&block, answer)?
            }
        };
        pairs.push((prompt, sample));
    }
    info!(split, %mode, count = pairs.len(), "data source loaded");
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn config_with_data_dir(dir: &Path) -> HarnessConfig {
        HarnessConfig {
            data_dir: dir.to_path_buf(),
            ..HarnessConfig::default()
        }
    }

    fn write_split(dir: &Path, split: &str, records: &[Value]) {
        let mut file = std::fs::File::create(dir.join(format!("{split}.jsonl"))).unwrap();
        for record in records {
            writeln!(file, "{record}").unwrap();
        }
    }

    #[test]
    fn test_question_block_letters_options() {
        let sample: Sample = serde_json::from_value(json!({
            "idx": 0,
            "question": "Which base pairs with adenine in DNA?",
            "options": ["thymine", "guanine", "cytosine"]
        }))
        .unwrap();
        let block = question_block(&sample).unwrap();
        assert_eq!(
            block,
            "Which base pairs with adenine in DNA?\nA) thymine\nB) guanine\nC) cytosine"
        );
    }

    #[test]
    fn test_load_data_zero_shot_renders_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_split(
            dir.path(),
            "bio",
            &[json!({
                "idx": 0,
                "question": "Q?",
                "options": ["a", "b"],
                "answer": "a"
            })],
        );
        let config = config_with_data_dir(dir.path());
        let templates = config.templates().unwrap();
        let pairs = load_data(&config, &templates, "bio", Mode::ZeroShot).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].0.contains("Q?\nA) a\nB) b"));
        assert!(pairs[0].0.contains("ANSWER: $LETTER"));
    }

    #[test]
    fn test_load_data_option_generation_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_split(
            dir.path(),
            "seed",
            &[json!({
                "idx": 3,
                "question": "Q?",
                "options": ["right", "wrong"],
                "answer": "right"
            })],
        );
        let config = config_with_data_dir(dir.path());
        let templates = config.templates().unwrap();
        let pairs = load_data(&config, &templates, "seed", Mode::OptionGeneration).unwrap();
        assert!(pairs[0].0.contains("Q?\nright\nwrong"));
        assert!(pairs[0].0.contains("The correct answer is: right"));
    }

    #[test]
    fn test_missing_split_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_data_dir(dir.path());
        let templates = config.templates().unwrap();
        assert!(load_data(&config, &templates, "nope", Mode::ZeroShot).is_err());
    }
}
