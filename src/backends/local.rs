use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;
use url::Url;

use super::openai::{
    CompletionRequest, CompletionResponse, OpenAiChatBackend, PromptInput, endpoint,
    flatten_history, post_json,
};
use super::{BackendError, ModelBackend, RetryConfig};
use crate::sample::{History, ResponsePayload};

/// Adapter for a locally served instruction-tuned model behind an
/// OpenAI-compatible chat endpoint (e.g. a vLLM server). The wire protocol is
/// identical to the hosted chat adapter, only the deployment differs.
pub struct LocalChatBackend {
    inner: OpenAiChatBackend,
}

impl LocalChatBackend {
    pub fn new(
        client: Client,
        base_url: Url,
        api_key: Option<String>,
        model: String,
        max_tokens: u32,
        system_prompt: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        LocalChatBackend {
            inner: OpenAiChatBackend::new(
                client,
                base_url,
                api_key,
                model,
                max_tokens,
                system_prompt,
                retry,
            ),
        }
    }
}

#[async_trait]
impl ModelBackend for LocalChatBackend {
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError> {
        self.inner.infer(prompts, histories).await
    }
}

/// Adapter for a locally served base (non-chat) model. The whole batch goes
/// out as one array-valued completions request so the server can schedule it
/// as a single forward pass; a failed request therefore fails the batch.
pub struct LocalBaseBackend {
    client: Client,
    url: Url,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    retry: RetryConfig,
}

impl LocalBaseBackend {
    pub fn new(
        client: Client,
        base_url: Url,
        api_key: Option<String>,
        model: String,
        max_tokens: u32,
        retry: RetryConfig,
    ) -> Self {
        let url = endpoint(&base_url, "completions").unwrap_or_else(|_| base_url.clone());
        LocalBaseBackend {
            client,
            url,
            api_key,
            model,
            max_tokens,
            retry,
        }
    }
}

#[async_trait]
impl ModelBackend for LocalBaseBackend {
    #[instrument(skip_all, fields(batch_size = prompts.len()))]
    async fn infer(
        &self,
        prompts: &[String],
        histories: &[History],
    ) -> Result<Vec<ResponsePayload>, BackendError> {
        let flattened: Vec<String> = prompts
            .iter()
            .zip(histories)
            .map(|(prompt, history)| flatten_history(history, prompt))
            .collect();
        let response: CompletionResponse = self
            .retry
            .retry(|| async {
                post_json(
                    &self.client,
                    &self.url,
                    self.api_key.as_deref(),
                    &CompletionRequest {
                        model: &self.model,
                        prompt: PromptInput::Batch(&flattened),
                        max_tokens: self.max_tokens,
                    },
                )
                .await
            })
            .await?;
        if response.choices.len() != prompts.len() {
            return Err(BackendError::Fatal(format!(
                "endpoint returned {} choices for {} prompts",
                response.choices.len(),
                prompts.len()
            )));
        }
        // Choices may arrive out of order; the index field maps them back.
        let mut texts: Vec<Option<String>> = vec![None; prompts.len()];
        for choice in response.choices {
            match texts.get_mut(choice.index) {
                Some(slot) => *slot = Some(choice.text),
                None => {
                    return Err(BackendError::Fatal(format!(
                        "choice index {} out of range",
                        choice.index
                    )));
                }
            }
        }
        texts
            .into_iter()
            .map(|text| {
                text.map(ResponsePayload::Text).ok_or_else(|| {
                    BackendError::Fatal("endpoint response is missing a choice index".into())
                })
            })
            .collect()
    }
}
