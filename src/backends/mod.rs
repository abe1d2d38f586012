use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{BackendConfig, HarnessConfig};
use crate::sample::{History, ResponsePayload};

mod local;
mod openai;

pub use local::{LocalBaseBackend, LocalChatBackend};
pub use openai::{OpenAiChatBackend, OpenAiCompletionBackend};

/// Which adapter a configured backend uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions endpoint.
    OpenaiChat,
    /// OpenAI-compatible legacy text completions endpoint.
    OpenaiCompletion,
    /// Locally served instruction-tuned model behind a chat endpoint.
    LocalChat,
    /// Locally served base model; prompts for a whole batch go out in one
    /// array-valued completions request.
    LocalBase,
}

/// A failure from a backend call. Transient failures are retried with
/// exponential backoff; fatal ones are surfaced immediately.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Retry policy for backend requests.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub num_retries: usize,
    pub max_delay_s: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            num_retries: 3,
            max_delay_s: 10.0,
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_jitter()
            .with_max_delay(Duration::from_secs_f32(self.max_delay_s))
            .with_max_times(self.num_retries)
    }

    /// Runs `f`, retrying transient failures with jittered exponential
    /// backoff up to `num_retries` extra attempts.
    pub async fn retry<F, Fut, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        f.retry(self.backoff())
            .when(BackendError::is_retryable)
            .notify(|error, delay| {
                warn!(%error, retry_delay = ?delay, "retrying backend request");
            })
            .await
    }
}

/// A model backend. One call covers one batch of samples; `prompts[i]` and
/// `histories[i]` describe the same sample.
///
/// Per-sample failures come back inline as [`ResponsePayload::Error`] entries
/// so the rest of the batch still makes progress. A top-level `Err` means the
/// whole batch failed and no entry is usable.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError>;
}

fn api_key(config: &BackendConfig) -> Result<Option<String>> {
    match &config.api_key_env {
        None => Ok(None),
        Some(var) => {
            let key = std::env::var(var)
                .with_context(|| format!("environment variable {var} is not set"))?;
            if key.is_empty() {
                bail!("environment variable {var} is empty");
            }
            Ok(Some(key))
        }
    }
}

/// Instantiates the backend named `name` in the config. Called lazily, only
/// once a run has established that some samples actually need inference.
pub fn load(
    name: &str,
    config: &HarnessConfig,
    accelerate: bool,
) -> Result<Arc<dyn ModelBackend>> {
    let backend_config = config.backend(name)?;
    let base_url = if accelerate {
        match &backend_config.accel_base_url {
            Some(url) => url.clone(),
            None => {
                warn!(model = name, "no accelerated endpoint configured, using base_url");
                backend_config.base_url.clone()
            }
        }
    } else {
        backend_config.base_url.clone()
    };
    let key = api_key(backend_config)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_s))
        .build()
        .context("failed to build HTTP client")?;
    info!(
        model = name,
        kind = ?backend_config.kind,
        endpoint = %base_url,
        "loading model backend"
    );
    let backend: Arc<dyn ModelBackend> = match backend_config.kind {
        BackendKind::OpenaiChat => Arc::new(OpenAiChatBackend::new(
            client,
            base_url,
            key,
            backend_config.model.clone(),
            config.max_tokens,
            config.system_prompt.clone(),
            config.retry,
        )),
        BackendKind::OpenaiCompletion => Arc::new(OpenAiCompletionBackend::new(
            client,
            base_url,
            key,
            backend_config.model.clone(),
            config.max_tokens,
            config.retry,
        )),
        BackendKind::LocalChat => Arc::new(LocalChatBackend::new(
            client,
            base_url,
            key,
            backend_config.model.clone(),
            config.max_tokens,
            config.system_prompt.clone(),
            config.retry,
        )),
        BackendKind::LocalBase => Arc::new(LocalBaseBackend::new(
            client,
            base_url,
            key,
            backend_config.model.clone(),
            config.max_tokens,
            config.retry,
        )),
    };
    Ok(backend)
}
