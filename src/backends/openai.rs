use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use super::{BackendError, ModelBackend, RetryConfig};
use crate::sample::{ChatMessage, History, ResponsePayload, build_conversation};

#[derive(Debug, Serialize)]
pub(super) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatChoice {
    pub message: ChatMessage,
}

/// Legacy completions request. `prompt` is a single string for per-sample
/// calls and an array when a base-model backend sends a whole batch at once.
#[derive(Debug, Serialize)]
pub(super) struct CompletionRequest<'a> {
    pub model: &'a str,
    pub prompt: PromptInput<'a>,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(super) enum PromptInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

#[derive(Debug, Deserialize)]
pub(super) struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CompletionChoice {
    pub text: String,
    #[serde(default)]
    pub index: usize,
}

pub(super) fn endpoint(base_url: &Url, path: &str) -> Result<Url, BackendError> {
    base_url
        .join(path)
        .map_err(|e| BackendError::Fatal(format!("invalid endpoint url: {e}")))
}

/// Connection problems, timeouts, rate limits and server errors are worth
/// retrying; anything else the endpoint rejected outright is not.
pub(super) fn classify_request_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() || error.is_connect() {
        return BackendError::Transient(error.to_string());
    }
    BackendError::Fatal(error.to_string())
}

pub(super) fn classify_status(status: StatusCode, body: String) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::Transient(format!("endpoint returned {status}: {body}"))
    } else {
        BackendError::Fatal(format!("endpoint returned {status}: {body}"))
    }
}

pub(super) async fn post_json<Req, Resp>(
    client: &Client,
    url: &Url,
    api_key: Option<&str>,
    request: &Req,
) -> Result<Resp, BackendError>
where
    Req: Serialize,
    Resp: for<'de> Deserialize<'de>,
{
    let mut builder = client.post(url.clone()).json(request);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    let response = builder.send().await.map_err(classify_request_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, body));
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::Fatal(format!("malformed endpoint response: {e}")))
}

/// Adapter for hosted OpenAI-compatible chat endpoints. Each sample becomes
/// its own chat completion request; history turns are replayed as alternating
/// user/assistant messages.
pub struct OpenAiChatBackend {
    client: Client,
    url: Url,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    system_prompt: Option<String>,
    retry: RetryConfig,
}

impl OpenAiChatBackend {
    pub fn new(
        client: Client,
        base_url: Url,
        api_key: Option<String>,
        model: String,
        max_tokens: u32,
        system_prompt: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        let url = endpoint(&base_url, "chat/completions")
            .unwrap_or_else(|_| base_url.clone());
        OpenAiChatBackend {
            client,
            url,
            api_key,
            model,
            max_tokens,
            system_prompt,
            retry,
        }
    }

    async fn infer_one(&self, prompt: &str, history: &History) -> Result<String, BackendError> {
        let messages = build_conversation(history, prompt, self.system_prompt.as_deref());
        let response: ChatCompletionResponse = self
            .retry
            .retry(|| async {
                post_json(
                    &self.client,
                    &self.url,
                    self.api_key.as_deref(),
                    &ChatCompletionRequest {
                        model: &self.model,
                        messages: &messages,
                        max_tokens: self.max_tokens,
                    },
                )
                .await
            })
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Fatal("response contained no choices".into()))
    }
}

#[async_trait]
impl ModelBackend for OpenAiChatBackend {
    #[instrument(skip_all, fields(batch_size = prompts.len()))]
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError> {
        let mut payloads = Vec::with_capacity(prompts.len());
        for (prompt, history) in prompts.iter().zip(histories) {
            // One sample failing its retry budget must not sink the batch.
            let payload = match self.infer_one(prompt, history).await {
                Ok(text) => ResponsePayload::Text(text),
                Err(error) => ResponsePayload::error(error.to_string()),
            };
            payloads.push(payload);
        }
        Ok(payloads)
    }
}

/// Adapter for hosted OpenAI-compatible legacy completions endpoints. History
/// is flattened into the prompt text since there is no message structure.
pub struct OpenAiCompletionBackend {
    client: Client,
    url: Url,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    retry: RetryConfig,
}

impl OpenAiCompletionBackend {
    pub fn new(
        client: Client,
        base_url: Url,
        api_key: Option<String>,
        model: String,
        max_tokens: u32,
        retry: RetryConfig,
    ) -> Self {
        let url = endpoint(&base_url, "completions").unwrap_or_else(|_| base_url.clone());
        OpenAiCompletionBackend {
            client,
            url,
            api_key,
            model,
            max_tokens,
            retry,
        }
    }

    async fn infer_one(&self, prompt: &str, history: &History) -> Result<String, BackendError> {
        let full_prompt = flatten_history(history, prompt);
        let response: CompletionResponse = self
            .retry
            .retry(|| async {
                post_json(
                    &self.client,
                    &self.url,
                    self.api_key.as_deref(),
                    &CompletionRequest {
                        model: &self.model,
                        prompt: PromptInput::Single(&full_prompt),
                        max_tokens: self.max_tokens,
                    },
                )
                .await
            })
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| BackendError::Fatal("response contained no choices".into()))
    }
}

/// Serializes prior rounds into plain text for backends with no chat shape.
pub(super) fn flatten_history(history: &History, prompt: &str) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }
    let mut text = String::new();
    for turn in history.values() {
        text.push_str(&turn.prompt);
        text.push_str("\n\n");
        text.push_str(&turn.response);
        text.push_str("\n\n");
    }
    text.push_str(prompt);
    text
}

#[async_trait]
impl ModelBackend for OpenAiCompletionBackend {
    #[instrument(skip_all, fields(batch_size = prompts.len()))]
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError> {
        let mut payloads = Vec::with_capacity(prompts.len());
        for (prompt, history) in prompts.iter().zip(histories) {
            let payload = match self.infer_one(prompt, history).await {
                Ok(text) => ResponsePayload::Text(text),
                Err(error) => ResponsePayload::error(error.to_string()),
            };
            payloads.push(payload);
        }
        Ok(payloads)
    }
}
