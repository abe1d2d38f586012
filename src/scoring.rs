use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ReservedKeys;
use crate::extract::{Extraction, extract_all_labels, extract_option_label};
use crate::sample::Sample;

/// How a record should be graded. Derived from the split name by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionKind {
    /// Plain single-answer multiple choice.
    Standard,
    /// Counterfactual items that additionally track whether the model picked
    /// the answer that would hold in real life.
    Counterfactual,
    /// Composite items where one response answers several sub-questions.
    Multi,
}

impl QuestionKind {
    /// Counterfactual splits and the Multi-* composite splits get auxiliary
    /// signals; everything else is graded as a standard item.
    pub fn from_split(split: &str) -> Self {
        if split == "counterfactual" {
            QuestionKind::Counterfactual
        } else if matches!(split, "Multi-Q" | "Multi-R" | "Multi-RQ") {
            QuestionKind::Multi
        } else {
            QuestionKind::Standard
        }
    }
}

/// Per-record grading tag, written into annotated report output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Correct,
    Incorrect,
    /// No option letter could be extracted from the text.
    Miss,
    /// The response itself was an error payload.
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreOutcome {
    pub predicted: Option<char>,
    pub is_correct: bool,
    pub status: EvalStatus,
    /// Only set for counterfactual items.
    pub is_real_life: Option<bool>,
    /// Only set for multi-question items: fraction of sub-answers correct.
    pub pass_rate: Option<f64>,
}

/// Derives the ground-truth letter from the position of the literal answer
/// string inside the option list. The letter is never stored redundantly in
/// the dataset, so a reshuffled option list stays consistent.
pub fn answer_letter(options: &[String], answer: &str) -> Option<char> {
    options
        .iter()
        .position(|option| option == answer)
        .map(|index| (b'A' + index as u8) as char)
}

fn ground_truth_letter(sample: &Sample) -> Option<char> {
    let options = sample.options()?;
    let answer = sample.answer()?;
    answer_letter(&options, answer)
}

fn num_options(sample: &Sample) -> usize {
    sample.options().map(|options| options.len()).unwrap_or(10)
}

/// Grades one record. Items without a resolvable ground-truth letter are never
/// counted correct; a missing or error response grades as `error`, a text
/// response with no extractable letter as `miss`.
pub fn score_sample(sample: &Sample, keys: &ReservedKeys, kind: QuestionKind) -> ScoreOutcome {
    let response = sample.raw_response(keys).cloned().unwrap_or(Value::Null);
    match kind {
        QuestionKind::Standard => score_single(sample, &response, None),
        QuestionKind::Counterfactual => {
            let real_life = real_life_letter(sample);
            score_single(sample, &response, Some(real_life))
        }
        QuestionKind::Multi => score_multi(sample, &response),
    }
}

fn score_single(
    sample: &Sample,
    response: &Value,
    real_life: Option<Option<char>>,
) -> ScoreOutcome {
    let extraction = extract_option_label(response, num_options(sample));
    let truth = ground_truth_letter(sample);
    let (predicted, status) = match extraction {
        Extraction::ErrorResponse => (None, EvalStatus::Error),
        Extraction::NoMatch => (None, EvalStatus::Miss),
        Extraction::Label(label) => {
            if truth == Some(label) {
                (Some(label), EvalStatus::Correct)
            } else {
                (Some(label), EvalStatus::Incorrect)
            }
        }
    };
    let is_real_life = real_life.map(|real_life_truth| match (predicted, real_life_truth) {
        (Some(p), Some(r)) => p == r,
        _ => false,
    });
    ScoreOutcome {
        predicted,
        is_correct: status == EvalStatus::Correct,
        status,
        is_real_life,
        pass_rate: None,
    }
}

/// The letter of the option that would be correct in real life, for
/// counterfactual items carrying a `real_life_answer` field.
fn real_life_letter(sample: &Sample) -> Option<char> {
    let options = sample.options()?;
    let real_life_answer = sample.get("real_life_answer")?.as_str()?;
    answer_letter(&options, real_life_answer)
}

fn score_multi(sample: &Sample, response: &Value) -> ScoreOutcome {
    let Some(text) = response.as_str() else {
        return ScoreOutcome {
            predicted: None,
            is_correct: false,
            status: EvalStatus::Error,
            is_real_life: None,
            pass_rate: Some(0.0),
        };
    };
    let expected = expected_letters(sample);
    let extracted = extract_all_labels(text, 10);
    let matched = expected
        .iter()
        .zip(extracted.iter())
        .filter(|(want, got)| want == got)
        .count();
    let pass_rate = if expected.is_empty() {
        0.0
    } else {
        matched as f64 / expected.len() as f64
    };
    let is_correct = !expected.is_empty() && matched == expected.len();
    let status = if is_correct {
        EvalStatus::Correct
    } else if extracted.is_empty() {
        EvalStatus::Miss
    } else {
        EvalStatus::Incorrect
    };
    ScoreOutcome {
        predicted: extracted.first().copied(),
        is_correct,
        status,
        is_real_life: None,
        pass_rate: Some(pass_rate),
    }
}

/// Expected sub-answer letters for a multi-question item: single-letter
/// entries are taken verbatim, longer entries are resolved against the
/// item's option list.
fn expected_letters(sample: &Sample) -> Vec<char> {
    let Some(answers) = sample.get("answers").and_then(Value::as_array) else {
        return Vec::new();
    };
    let options = sample.options().unwrap_or_default();
    answers
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|answer| {
            let trimmed = answer.trim();
            if trimmed.len() == 1 {
                trimmed.chars().next().map(|c| c.to_ascii_uppercase())
            } else {
                answer_letter(&options, trimmed)
            }
        })
        .collect()
}
