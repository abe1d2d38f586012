use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

/// Outcome of answer extraction on one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// A single option letter was found.
    Label(char),
    /// The response was a structured error payload, not text.
    ErrorResponse,
    /// The response was text but no option letter could be found.
    NoMatch,
}

impl Extraction {
    pub fn label(self) -> Option<char> {
        match self {
            Extraction::Label(c) => Some(c),
            _ => None,
        }
    }
}

/// Markdown/LaTeX decoration tokens stripped before pattern matching, in
/// order. These are literal replacements, not regexes.
const NORMALIZE_REPLACEMENTS: &[(&str, &str)] = &[
    ("**", ""),
    ("$\\boxed{", ""),
    ("}$", ""),
    ("\\$", ""),
    ("$\\text{", ""),
    ("$", ""),
    ("\\mathrm{", ""),
    ("\\{", ""),
    ("\\text", ""),
    ("\\(", ""),
    ("\\mathbf{", ""),
    ("{", ""),
    ("\\boxed", ""),
];

/// Removes markdown and LaTeX formatting that would otherwise prevent a
/// pattern match.
pub fn normalize_response(response: &str) -> String {
    let mut text = response.to_string();
    for (from, to) in NORMALIZE_REPLACEMENTS {
        text = text.replace(from, to);
    }
    text
}

fn letters(num_options: usize) -> String {
    let count = num_options.clamp(1, 26);
    (0..count).map(|i| (b'A' + i as u8) as char).collect()
}

/// The ordered extraction rules: explicit answer phrasings first, bare
/// parenthesized letters last. Unparenthesized variants come before the
/// parenthesized ones so precise lexical cues win over positional guesses.
fn pattern_sources(option_letters: &str) -> Vec<String> {
    let o = option_letters;
    vec![
        format!(r"[Tt]he answer to the question is:?\s*([{o}])\s*.*"),
        format!(r"[Tt]he correct answer option is:?\s*([{o}])\s*.*"),
        format!(r"[Tt]he correct option is:?\s*([{o}])\s*.*"),
        format!(r"[Tt]he correct answer is:?\s*([{o}])\s*.*"),
        format!(r"[Tt]he answer is:?\s*([{o}])\s*.*"),
        format!(r"(?i)ANSWER\s*:\s*([{o}])\s*.*"),
        format!(r"([{o}])\s*[：:.]"),
        format!(r"[Tt]he answer to the question is:?\s*\(?([{o}])\)?\s*.*"),
        format!(r"[Tt]he correct answer option is:?.*?boxed\{{\(?([{o}])\)?\}}\s*.*"),
        format!(r"[Tt]he correct option is:?.*?boxed\{{\(?([{o}])\)?\}}\s*.*"),
        format!(r"[Tt]he correct answer is:?.*?boxed\{{\(?([{o}])\)?\}}\s*.*"),
        format!(r"[Tt]he correct answer is option:?\s*\(?([{o}])\)?\s*.*"),
        format!(r"[Tt]he correct answer is:?\s*\(?([{o}])\)?\s*.*"),
        format!(r"[Tt]he answer is option:?\s*\(?([{o}])\)?\s*.*"),
        format!(r"[Tt]he answer is:?\s*\(?([{o}])\)?\s*.*"),
        format!(r"(?i)ANSWER\s*:\s*\(?([{o}])\)?\s*.*"),
        format!(r"\(?([{o}])\)?\s*(?:[。，,：:\.$])?"),
        format!(r"\(?([{o}])\)?\s*.*"),
        format!(r"([{o}])\s*:"),
    ]
}

fn compile_patterns(option_letters: &str) -> Vec<Regex> {
    pattern_sources(option_letters)
        .iter()
        .map(|source| Regex::new(source).expect("extraction pattern must compile"))
        .collect()
}

lazy_static! {
    /// Compiled rule set for the standard ten-option (A-J) label range.
    static ref DEFAULT_PATTERNS: Vec<Regex> = compile_patterns("ABCDEFGHIJ");
    static ref ANSWER_CUE: Regex =
        Regex::new(r"(?i)ANSWER\s*:\s*\(?([A-Z])\)?").expect("answer cue pattern must compile");
}

fn first_match(patterns: &[Regex], text: &str) -> Option<char> {
    for pattern in patterns {
        if let Some(captures) = pattern.captures(text) {
            if let Some(group) = captures.get(1) {
                return group.as_str().chars().next();
            }
        }
    }
    None
}

/// Extracts a single option letter from a response payload.
///
/// Structured error payloads short-circuit to [`Extraction::ErrorResponse`].
/// Text is normalized, then the rule list runs against the last line first and
/// falls back to the full text, since models usually restate the final choice
/// at the end.
pub fn extract_option_label(response: &Value, num_options: usize) -> Extraction {
    let Some(raw) = response.as_str() else {
        return Extraction::ErrorResponse;
    };

    let normalized = normalize_response(raw);
    let text = normalized.trim_end();
    let last_line = text.rsplit('\n').next().unwrap_or("");

    let compiled;
    let patterns: &[Regex] = if num_options == 10 {
        &DEFAULT_PATTERNS
    } else {
        compiled = compile_patterns(&letters(num_options));
        &compiled
    };

    if let Some(label) = first_match(patterns, last_line) {
        return Extraction::Label(label);
    }
    if let Some(label) = first_match(patterns, text) {
        return Extraction::Label(label);
    }
    Extraction::NoMatch
}

/// Collects every `ANSWER: X` style label in order of appearance. Used for
/// multi-question items where one response answers several sub-questions.
pub fn extract_all_labels(text: &str, num_options: usize) -> Vec<char> {
    let allowed = letters(num_options);
    let normalized = normalize_response(text);
    ANSWER_CUE
        .captures_iter(&normalized)
        .filter_map(|captures| captures.get(1))
        .filter_map(|group| group.as_str().chars().next())
        .filter(|c| allowed.contains(*c))
        .collect()
}
