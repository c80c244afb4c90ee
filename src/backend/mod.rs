//! Backend trait and normalized chat/embedding types.
//!
//! The [`Backend`] trait abstracts over LLM providers, translating between
//! normalized [`ChatRequest`]/[`ChatResponse`] types and provider-specific
//! HTTP APIs. A [`BackendAdapter`] pairs one backend with one model, a base
//! URL and a transport retry budget.
//!
//! ## Architecture
//!
//! ```text
//! StructuredClient ──► BackendAdapter::chat() ──► with_backoff ──► Backend::complete()
//!                                                                     │
//!                                    ┌───────────────┬────────────────┴──┐
//!                               OllamaBackend   OpenAiBackend       GoogleBackend
//!                               /api/chat       /v1/chat/completions  :generateContent
//!                               /api/embed      /v1/embeddings        :batchEmbedContents
//! ```

pub mod adapter;
pub mod backoff;
pub mod google;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use adapter::{BackendAdapter, BackendAdapterBuilder};
pub use backoff::BackoffConfig;
pub use google::GoogleBackend;
pub use mock::{MockBackend, MockStep};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Callback invoked before each transport retry.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Sampling options for one request. Unset fields fall back to the
/// adapter's defaults and then to the provider's own defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    /// Context window size. Only Ollama honours it.
    pub num_ctx: Option<u32>,
    pub top_p: Option<f64>,
    /// Free-form provider options (Ollama `options` entries).
    pub extra: Map<String, Value>,
}

impl ChatOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Fill every unset field of `self` from `defaults`.
    pub fn or(&self, defaults: &ChatOptions) -> ChatOptions {
        let mut extra = defaults.extra.clone();
        for (k, v) in &self.extra {
            extra.insert(k.clone(), v.clone());
        }
        ChatOptions {
            temperature: self.temperature.or(defaults.temperature),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            seed: self.seed.or(defaults.seed),
            num_ctx: self.num_ctx.or(defaults.num_ctx),
            top_p: self.top_p.or(defaults.top_p),
            extra,
        }
    }
}

/// Output format hint passed to the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FormatHint {
    /// Free text.
    #[default]
    None,
    /// Generic "respond with a JSON object".
    Json,
    /// A JSON Schema the provider may enforce natively.
    Schema(Value),
}

impl FormatHint {
    pub fn wants_json(&self) -> bool {
        !matches!(self, FormatHint::None)
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// A normalized chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-side model name.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
    pub format: FormatHint,
}

/// A normalized chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Usage,
}

/// A normalized embedding request.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: String,
    pub input: Vec<String>,
}

/// A normalized embedding response; one vector per input, in order.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    pub usage: Usage,
}

/// Abstraction over LLM providers.
///
/// Implementors perform exactly one HTTP exchange per call. Transport retry
/// is layered on top by [`with_backoff`]; semantic retry belongs to the
/// [`StructuredClient`](crate::client::StructuredClient).
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one chat completion.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse>;

    /// Embed a batch of texts.
    async fn embed(
        &self,
        client: &Client,
        base_url: &str,
        request: &EmbedRequest,
    ) -> Result<EmbedResponse>;

    /// Provider name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether a [`PipelineError`] is a transient transport failure.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] (connection/timeout errors)
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Run `op` with transport-level retry and linear backoff.
///
/// Non-retryable errors are returned as-is on first sight. A retryable error
/// that survives the whole budget is wrapped in
/// [`PipelineError::TransportExhausted`].
pub async fn with_backoff<T, F, Fut>(
    provider: &'static str,
    config: &BackoffConfig,
    mut on_retry: RetryCallback<'_>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e, config) => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                return Err(PipelineError::TransportExhausted {
                    provider,
                    attempts: attempt + 1,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                attempt += 1;
                let retry_after = match &e {
                    PipelineError::HttpError { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = config.delay_with_hint(attempt, retry_after);
                let reason = e.to_string();
                warn!(
                    provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "transport error, retrying"
                );
                if let Some(ref mut cb) = on_retry {
                    cb(attempt, delay, &reason);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Parse a `Retry-After` header value given in whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Send a prepared request and decode a JSON body, mapping non-2xx
/// statuses to [`PipelineError::HttpError`].
pub(crate) async fn send_json(request: reqwest::RequestBuilder) -> Result<Value> {
    let resp = request.send().await?;
    let status = resp.status();

    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::HttpError {
            status: status.as_u16(),
            body,
            retry_after,
        });
    }

    Ok(resp.json().await?)
}

/// Read a token count at `pointer`, defaulting to zero.
pub(crate) fn token_count(json: &Value, pointer: &str) -> u64 {
    json.pointer(pointer).and_then(|v| v.as_u64()).unwrap_or(0)
}
