use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Deserialize;
use url::Url;

use crate::backends::{BackendKind, RetryConfig};

/// Names of the reserved per-sample fields. Configurable so the harness can
/// run against datasets that already use one of these names for their own
/// data.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReservedKeys {
    pub id: String,
    pub prompt: String,
    pub response: String,
    pub status: String,
    pub history: String,
    /// Key inside a structured response payload that marks it as an error.
    pub error: String,
}

impl Default for ReservedKeys {
    fn default() -> Self {
        ReservedKeys {
            id: "idx".to_string(),
            prompt: "prompt".to_string(),
            response: "response".to_string(),
            status: "status".to_string(),
            history: "history".to_string(),
            error: "error".to_string(),
        }
    }
}

/// Prompt template sources. The defaults cover the standard zero-shot
/// multiple-choice phrasing plus the two multi-round modes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TemplateSet {
    pub zero_shot: String,
    pub self_correction: String,
    pub option_generation: String,
}

const DEFAULT_ZERO_SHOT: &str = "\
Answer the following multiple choice question. The last line of your response \
should be of the following format: 'ANSWER: $LETTER' (without quotes) where \
LETTER is the letter of the correct option. Think step by step before answering.

{{ question }}";

const DEFAULT_SELF_CORRECTION: &str = "\
Your previous answer may be incorrect. Carefully re-examine the question and \
your reasoning, then answer again. The last line of your response should be of \
the following format: 'ANSWER: $LETTER' (without quotes).";

const DEFAULT_OPTION_GENERATION: &str = "\
Below is a multiple choice question together with its current options.

{{ question }}

The correct answer is: {{ answer }}

Propose exactly one new plausible but incorrect distractor option that is not \
already present. Wrap only the new option text in <distractor></distractor> tags.";

impl Default for TemplateSet {
    fn default() -> Self {
        TemplateSet {
            zero_shot: DEFAULT_ZERO_SHOT.to_string(),
            self_correction: DEFAULT_SELF_CORRECTION.to_string(),
            option_generation: DEFAULT_OPTION_GENERATION.to_string(),
        }
    }
}

/// Compiled prompt templates.
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    pub fn new(set: &TemplateSet) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template_owned("zero_shot", set.zero_shot.clone())?;
        env.add_template_owned("self_correction", set.self_correction.clone())?;
        env.add_template_owned("option_generation", set.option_generation.clone())?;
        Ok(Templates { env })
    }

    pub fn render_zero_shot(&self, question: &str) -> Result<String> {
        Ok(self
            .env
            .get_template("zero_shot")?
            .render(context! { question => question })?)
    }

    pub fn render_self_correction(&self) -> Result<String> {
        Ok(self.env.get_template("self_correction")?.render(context! {})?)
    }

    pub fn render_option_generation(&self, question: &str, answer: &str) -> Result<String> {
        Ok(self
            .env
            .get_template("option_generation")?
            .render(context! { question => question, answer => answer })?)
    }
}

/// A single backend entry in the config file, selected by `--model-name`.
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: Url,
    /// Endpoint of the accelerated engine (e.g. a vLLM server) used when the
    /// run is started with `--use-accel`. Falls back to `base_url`.
    #[serde(default)]
    pub accel_base_url: Option<Url>,
    /// Model identifier sent on the wire.
    pub model: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Top-level harness configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub data_dir: PathBuf,
    pub max_tokens: u32,
    pub max_rounds: u32,
    pub request_timeout_s: u64,
    pub system_prompt: Option<String>,
    pub keys: ReservedKeys,
    pub retry: RetryConfig,
    pub templates: TemplateSet,
    pub backends: HashMap<String, BackendConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            data_dir: PathBuf::from("data"),
            max_tokens: 2000,
            max_rounds: 5,
            request_timeout_s: 120,
            system_prompt: None,
            keys: ReservedKeys::default(),
            retry: RetryConfig::default(),
            templates: TemplateSet::default(),
            backends: HashMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: HarnessConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.backends.keys().map(String::as_str).collect();
            known.sort_unstable();
            anyhow!("model '{name}' is not configured; known models: {known:?}")
        })
    }

    pub fn templates(&self) -> Result<Templates> {
        Templates::new(&self.templates)
    }
}
