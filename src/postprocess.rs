use anyhow::Result;
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{ReservedKeys, Templates};
use crate::dataset::Mode;
use crate::sample::{HistoryTurn, Sample, Status};
use crate::scoring::{QuestionKind, score_sample};

/// The option-generation loop stops growing a sample's option list at this
/// size.
pub const TARGET_OPTIONS: usize = 10;

lazy_static! {
    static ref DISTRACTOR_TAG: Regex = Regex::new(r"(?s)<distractor>(.*?)</distractor>")
        .expect("distractor pattern must compile");
}

/// Shared inputs for a post-processing pass over one batch.
pub struct PostContext<'a> {
    pub keys: &'a ReservedKeys,
    pub templates: &'a Templates,
    pub max_rounds: u32,
    pub kind: QuestionKind,
}

/// Result of post-processing a batch: `to_save` goes to the durable log
/// (interim `processing` records included, for crash recovery), `to_return`
/// re-enters the live pipeline for another round.
#[derive(Debug, Default)]
pub struct Processed {
    pub to_save: Vec<Sample>,
    pub to_return: Vec<Sample>,
}

/// Decides, per sample, whether a round is final or feeds another round.
pub enum PostProcessor {
    /// Single-round: every response is final as-is.
    Default,
    /// Re-prompt until the extracted answer is correct or the round budget
    /// runs out.
    SelfCorrection { with_needle: bool },
    /// Grow the option list one distractor at a time until it reaches
    /// [`TARGET_OPTIONS`] or the round budget runs out.
    OptionGeneration,
}

impl PostProcessor {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::ZeroShot => PostProcessor::Default,
            Mode::SelfCorrection => PostProcessor::SelfCorrection { with_needle: false },
            Mode::SelfCorrectionWithNeedle => PostProcessor::SelfCorrection { with_needle: true },
            Mode::OptionGeneration => PostProcessor::OptionGeneration,
        }
    }

    /// Partitions a batch that just received responses.
    pub fn process(&self, batch: Vec<Sample>, ctx: &PostContext<'_>) -> Result<Processed> {
        let mut processed = Processed::default();
        for sample in batch {
            match self {
                PostProcessor::Default => processed.to_save.push(sample),
                PostProcessor::SelfCorrection { with_needle } => {
                    self_correction_round(sample, *with_needle, ctx, &mut processed)?;
                }
                PostProcessor::OptionGeneration => {
                    option_generation_round(sample, ctx, &mut processed)?;
                }
            }
        }
        Ok(processed)
    }
}

/// Needle strings attached to a sample, for the needle-in-haystack variant.
/// Accepts either a `needles` array or a single `needle` string.
fn needle_prefix(sample: &Sample) -> Option<String> {
    if let Some(needles) = sample.get("needles").and_then(Value::as_array) {
        let lines: Vec<&str> = needles.iter().filter_map(Value::as_str).collect();
        if !lines.is_empty() {
            return Some(lines.join("\n"));
        }
    }
    sample
        .get("needle")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn self_correction_round(
    mut sample: Sample,
    with_needle: bool,
    ctx: &PostContext<'_>,
    processed: &mut Processed,
) -> Result<()> {
    let Some(text) = sample
        .response(ctx.keys)
        .as_ref()
        .and_then(|payload| payload.as_text())
        .map(str::to_string)
    else {
        sample.set_status(ctx.keys, Status::Error);
        processed.to_save.push(sample);
        return Ok(());
    };

    let outcome = score_sample(&sample, ctx.keys, ctx.kind);
    if outcome.is_correct {
        sample.set_status(ctx.keys, Status::Completed);
        processed.to_save.push(sample);
        return Ok(());
    }

    let mut history = sample.history(ctx.keys);
    // A final wrong round is saved without extending history, so the record
    // shows the response that exhausted the budget but never an over-long
    // history.
    if history.len() as u32 + 1 >= ctx.max_rounds {
        sample.set_status(ctx.keys, Status::MaxRounds);
        processed.to_save.push(sample);
        return Ok(());
    }

    let prompt = sample.prompt(ctx.keys).unwrap_or_default().to_string();
    let round = history.len() as u32;
    history.insert(round, HistoryTurn { prompt, response: text });
    sample.set_history(ctx.keys, &history);

    let followup = ctx.templates.render_self_correction()?;
    let next_prompt = match with_needle {
        true => match needle_prefix(&sample) {
            Some(prefix) => format!("{prefix}\n{followup}"),
            None => followup,
        },
        false => followup,
    };
    sample.set_prompt(ctx.keys, next_prompt);
    sample.set_status(ctx.keys, Status::Processing);
    debug!(round = round + 1, "sample requeued for self-correction");
    processed.to_save.push(sample.clone());
    processed.to_return.push(sample);
    Ok(())
}

/// Case and whitespace insensitive form used for duplicate detection.
fn normalized_option(option: &str) -> String {
    option
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn extract_distractor(text: &str) -> Option<String> {
    DISTRACTOR_TAG
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().trim().to_string())
        .filter(|option| !option.is_empty())
}

fn option_generation_round(
    mut sample: Sample,
    ctx: &PostContext<'_>,
    processed: &mut Processed,
) -> Result<()> {
    let Some(text) = sample
        .response(ctx.keys)
        .as_ref()
        .and_then(|payload| payload.as_text())
        .map(str::to_string)
    else {
        sample.set_status(ctx.keys, Status::Error);
        processed.to_save.push(sample);
        return Ok(());
    };

    let mut options = sample.options().unwrap_or_default();
    let mut round = sample
        .get("round")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let new_option = extract_distractor(&text).filter(|candidate| {
        let normalized = normalized_option(candidate);
        !options
            .iter()
            .any(|existing| normalized_option(existing) == normalized)
    });

    match new_option {
        Some(option) => {
            options.push(option);
            options.shuffle(&mut rand::rng());
            sample.insert("options", json!(options));
        }
        None => {
            // Unproductive round: only these count against the budget.
            round += 1;
            sample.insert("round", json!(round));
            debug!(round, "no new distractor extracted");
        }
    }

    if options.len() >= TARGET_OPTIONS {
        sample.set_status(ctx.keys, Status::Completed);
        processed.to_save.push(sample);
        return Ok(());
    }
    if round >= ctx.max_rounds {
        sample.set_status(ctx.keys, Status::MaxRounds);
        processed.to_save.push(sample);
        return Ok(());
    }

    let question = sample
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let answer = sample.answer().unwrap_or_default().to_string();
    let block = format!("{question}\n{}", options.join("\n"));
    sample.set_prompt(ctx.keys, ctx.templates.render_option_generation(&block, &answer)?);
    sample.set_status(ctx.keys, Status::Processing);
    processed.to_save.push(sample.clone());
    processed.to_return.push(sample);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateSet;
    use serde_json::json;

    fn sample(value: serde_json::Value) -> Sample {
        serde_json::from_value(value).unwrap()
    }

    struct TestCtx {
        keys: ReservedKeys,
        templates: Templates,
    }

    impl TestCtx {
        fn new() -> Self {
            TestCtx {
                keys: ReservedKeys::default(),
                templates: Templates::new(&TemplateSet::default()).unwrap(),
            }
        }

        fn ctx(&self, max_rounds: u32) -> PostContext<'_> {
            PostContext {
                keys: &self.keys,
                templates: &self.templates,
                max_rounds,
                kind: QuestionKind::Standard,
            }
        }
    }

    #[test]
    fn test_default_saves_everything() {
        let t = TestCtx::new();
        let batch = vec![
            sample(json!({"idx": 1, "response": "ANSWER: A"})),
            sample(json!({"idx": 2, "response": {"error": "boom"}})),
        ];
        let processed = PostProcessor::Default.process(batch, &t.ctx(5)).unwrap();
        assert_eq!(processed.to_save.len(), 2);
        assert!(processed.to_return.is_empty());
    }

    #[test]
    fn test_self_correction_correct_answer_completes() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "options": ["right", "wrong"],
            "answer": "right",
            "response": "ANSWER: A"
        }))];
        let processor = PostProcessor::SelfCorrection { with_needle: false };
        let processed = processor.process(batch, &t.ctx(5)).unwrap();
        assert!(processed.to_return.is_empty());
        assert_eq!(processed.to_save.len(), 1);
        assert_eq!(
            processed.to_save[0].status(&t.keys),
            Some(Status::Completed)
        );
    }

    #[test]
    fn test_self_correction_wrong_answer_requeues_with_history() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "options": ["right", "wrong"],
            "answer": "right",
            "prompt": "original prompt",
            "response": "ANSWER: B"
        }))];
        let processor = PostProcessor::SelfCorrection { with_needle: false };
        let processed = processor.process(batch, &t.ctx(5)).unwrap();
        assert_eq!(processed.to_return.len(), 1);
        assert_eq!(processed.to_save.len(), 1);
        let requeued = &processed.to_return[0];
        assert_eq!(requeued.status(&t.keys), Some(Status::Processing));
        let history = requeued.history(&t.keys);
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(&0).unwrap().prompt, "original prompt");
        assert_eq!(history.get(&0).unwrap().response, "ANSWER: B");
        assert!(requeued.prompt(&t.keys).unwrap().contains("re-examine"));
    }

    #[test]
    fn test_self_correction_round_budget_is_terminal() {
        let t = TestCtx::new();
        let mut s = sample(json!({
            "idx": 1,
            "options": ["right", "wrong"],
            "answer": "right",
            "prompt": "p",
            "response": "ANSWER: B",
            "history": {
                "0": {"prompt": "p0", "response": "r0"},
                "1": {"prompt": "p1", "response": "r1"}
            }
        }));
        let processor = PostProcessor::SelfCorrection { with_needle: false };
        let processed = processor.process(vec![s.clone()], &t.ctx(3)).unwrap();
        assert!(processed.to_return.is_empty());
        let saved = &processed.to_save[0];
        assert_eq!(saved.status(&t.keys), Some(Status::MaxRounds));
        // History never grows past the round bound.
        assert_eq!(saved.history(&t.keys).len(), 2);

        // With a larger budget the same sample would have been requeued.
        s.remove("history");
        let processed = processor.process(vec![s], &t.ctx(3)).unwrap();
        assert_eq!(processed.to_return.len(), 1);
    }

    #[test]
    fn test_self_correction_error_response_is_terminal() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "options": ["right", "wrong"],
            "answer": "right",
            "response": {"error": "timeout"}
        }))];
        let processor = PostProcessor::SelfCorrection { with_needle: false };
        let processed = processor.process(batch, &t.ctx(5)).unwrap();
        assert!(processed.to_return.is_empty());
        assert_eq!(processed.to_save[0].status(&t.keys), Some(Status::Error));
    }

    #[test]
    fn test_needle_prefix_prepended() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "options": ["right", "wrong"],
            "answer": "right",
            "needles": ["fact one", "fact two"],
            "prompt": "p",
            "response": "ANSWER: B"
        }))];
        let processor = PostProcessor::SelfCorrection { with_needle: true };
        let processed = processor.process(batch, &t.ctx(5)).unwrap();
        let prompt = processed.to_return[0].prompt(&t.keys).unwrap().to_string();
        assert!(prompt.starts_with("fact one\nfact two\n"));
        assert!(prompt.contains("re-examine"));
    }

    #[test]
    fn test_option_generation_appends_new_distractor() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "question": "Q?",
            "options": ["a", "b"],
            "answer": "a",
            "response": "How about <distractor>brand new option</distractor>?"
        }))];
        let processed = PostProcessor::OptionGeneration
            .process(batch, &t.ctx(5))
            .unwrap();
        assert_eq!(processed.to_return.len(), 1);
        let requeued = &processed.to_return[0];
        let options = requeued.options().unwrap();
        assert_eq!(options.len(), 3);
        assert!(options.contains(&"brand new option".to_string()));
        // unproductive-round counter untouched
        assert!(requeued.get("round").is_none());
        assert!(requeued.prompt(&t.keys).unwrap().contains("<distractor>"));
    }

    #[test]
    fn test_option_generation_duplicate_counts_against_budget() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "question": "Q?",
            "options": ["a", "Existing  Option"],
            "answer": "a",
            "response": "<distractor>existing option</distractor>"
        }))];
        let processed = PostProcessor::OptionGeneration
            .process(batch, &t.ctx(5))
            .unwrap();
        assert_eq!(processed.to_return.len(), 1);
        let requeued = &processed.to_return[0];
        assert_eq!(requeued.options().unwrap().len(), 2);
        assert_eq!(requeued.get("round"), Some(&json!(1)));
    }

    #[test]
    fn test_option_generation_target_size_completes() {
        let t = TestCtx::new();
        let options: Vec<String> = (0..9).map(|i| format!("option {i}")).collect();
        let batch = vec![sample(json!({
            "idx": 1,
            "question": "Q?",
            "options": options,
            "answer": "option 0",
            "response": "<distractor>the tenth option</distractor>"
        }))];
        let processed = PostProcessor::OptionGeneration
            .process(batch, &t.ctx(5))
            .unwrap();
        assert!(processed.to_return.is_empty());
        let saved = &processed.to_save[0];
        assert_eq!(saved.status(&t.keys), Some(Status::Completed));
        assert_eq!(saved.options().unwrap().len(), 10);
    }

    #[test]
    fn test_option_generation_round_budget_is_terminal() {
        let t = TestCtx::new();
        let batch = vec![sample(json!({
            "idx": 1,
            "question": "Q?",
            "options": ["a", "b"],
            "answer": "a",
            "round": 4,
            "response": "no tags here"
        }))];
        let processed = PostProcessor::OptionGeneration
            .process(batch, &t.ctx(5))
            .unwrap();
        assert!(processed.to_return.is_empty());
        assert_eq!(
            processed.to_save[0].status(&t.keys),
            Some(Status::MaxRounds)
        );
    }
}
