//! One backend bound to one model.
//!
//! [`BackendAdapter`] carries the HTTP client, backend, base URL, transport
//! retry budget and default sampling options for a single model identifier.
//! It is constructed once per model and owned by the
//! [`StructuredClient`](crate::client::StructuredClient).

use super::{
    with_backoff, Backend, BackoffConfig, ChatMessage, ChatOptions, ChatRequest, EmbedRequest,
    FormatHint, GoogleBackend, OllamaBackend, OpenAiBackend, Usage,
};
use crate::config::{PipelineConfig, ProviderConfig};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::provider::{ModelSpec, Provider};
use crate::PipelineError;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A backend adapter for a single model.
///
/// # Example
///
/// ```
/// use novel_pipeline::backend::{BackendAdapter, BackoffConfig, MockBackend};
/// use std::sync::Arc;
///
/// let adapter = BackendAdapter::builder("mock://writer")
///     .backend(Arc::new(MockBackend::fixed("Once upon a time.")))
///     .backoff(BackoffConfig::none())
///     .build()
///     .unwrap();
/// assert_eq!(adapter.label(), "mock://writer");
/// ```
pub struct BackendAdapter {
    label: String,
    model: String,
    backend: Arc<dyn Backend>,
    client: Client,
    base_url: String,
    backoff: BackoffConfig,
    defaults: ChatOptions,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl BackendAdapter {
    /// Create a builder. `label` is the identifier callers use to select
    /// this adapter; it is also the provider-side model name unless
    /// [`model`](BackendAdapterBuilder::model) overrides it.
    pub fn builder(label: impl Into<String>) -> BackendAdapterBuilder {
        BackendAdapterBuilder {
            label: label.into(),
            model: None,
            backend: None,
            client: None,
            base_url: None,
            backoff: None,
            defaults: ChatOptions::default(),
            event_handler: None,
            timeout: None,
        }
    }

    /// Build an adapter from a parsed model identifier.
    ///
    /// Fails with [`PipelineError::MissingCredential`] when the provider
    /// needs an API key and none is configured.
    pub fn from_spec(
        label: impl Into<String>,
        spec: &ModelSpec,
        config: &PipelineConfig,
    ) -> Result<BackendAdapterBuilder> {
        let provider_config = config.provider(spec.provider);
        let api_key = resolve_credential(spec.provider, &provider_config)?;

        let backend: Arc<dyn Backend> = match (spec.provider, api_key) {
            (Provider::Ollama, _) => Arc::new(OllamaBackend),
            (Provider::OpenAi, key) => {
                let mut b = OpenAiBackend::new();
                if let Some(key) = key {
                    b = b.with_api_key(key);
                }
                Arc::new(b)
            }
            (Provider::OpenRouter, key) => {
                let mut b = OpenAiBackend::openrouter();
                if let Some(key) = key {
                    b = b.with_api_key(key);
                }
                Arc::new(b)
            }
            (Provider::Google, key) => Arc::new(GoogleBackend::new(key.unwrap_or_default())),
        };

        let fallback_url = provider_config
            .base_url
            .clone()
            .unwrap_or_else(|| spec.provider.default_base_url().to_string());

        let mut backoff = BackoffConfig::for_provider(spec.provider);
        if let Some(n) = provider_config.max_retries {
            backoff.max_retries = n;
        }
        if let Some(ms) = provider_config.retry_step_ms {
            backoff.step = Duration::from_millis(ms);
        }

        let generation = ChatOptions {
            temperature: config.generation.temperature,
            max_tokens: config.generation.max_tokens,
            ..Default::default()
        };

        Ok(BackendAdapter::builder(label)
            .model(spec.model.clone())
            .backend(backend)
            .base_url(spec.base_url(&fallback_url))
            .backoff(backoff)
            .defaults(spec.defaults.or(&generation))
            .timeout(Duration::from_secs(provider_config.timeout_secs)))
    }

    /// Identifier this adapter is registered under.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Provider-side model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Seed from the model identifier, or `fallback` when it sets none.
    pub fn seed_or(&self, fallback: u64) -> u64 {
        self.defaults.seed.unwrap_or(fallback)
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Send `messages` and return them with the assistant reply appended.
    ///
    /// Transport failures are retried according to the backoff budget; the
    /// caller sees either a reply or a terminal error.
    pub async fn chat(
        &self,
        mut messages: Vec<ChatMessage>,
        options: &ChatOptions,
        format: &FormatHint,
    ) -> Result<(Vec<ChatMessage>, Usage)> {
        if messages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "chat requires at least one message".into(),
            ));
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            options: options.or(&self.defaults),
            format: format.clone(),
        };
        debug!(
            model = %self.label,
            turns = request.messages.len(),
            seed = ?request.options.seed,
            "sending chat request"
        );

        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            emit(
                &self.event_handler,
                Event::TransportRetry {
                    model: self.label.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };
        let response = with_backoff(
            self.backend.name(),
            &self.backoff,
            Some(&mut on_retry),
            || self.backend.complete(&self.client, &self.base_url, &request),
        )
        .await?;

        messages = request.messages;
        messages.push(ChatMessage::assistant(response.text));
        Ok((messages, response.usage))
    }

    /// Embed `texts`, one vector per input.
    pub async fn embed(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, Usage)> {
        if texts.is_empty() {
            return Ok((Vec::new(), Usage::default()));
        }
        let request = EmbedRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };
        let response = with_backoff(self.backend.name(), &self.backoff, None, || {
            self.backend.embed(&self.client, &self.base_url, &request)
        })
        .await?;
        Ok((response.vectors, response.usage))
    }
}

impl std::fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("label", &self.label)
            .field("model", &self.model)
            .field("backend", &self.backend.name())
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Resolve the API key for `provider`: inline key first, then the
/// configured (or default) environment variable.
fn resolve_credential(provider: Provider, config: &ProviderConfig) -> Result<Option<String>> {
    let Some(default_env) = provider.default_api_key_env() else {
        return Ok(None);
    };
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        return Ok(Some(key.to_string()));
    }
    let env_var = config
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_env.to_string());
    match std::env::var(&env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
        _ => Err(PipelineError::MissingCredential {
            provider: provider.name(),
            env_var,
        }),
    }
}

/// Builder for [`BackendAdapter`].
pub struct BackendAdapterBuilder {
    label: String,
    model: Option<String>,
    backend: Option<Arc<dyn Backend>>,
    client: Option<Client>,
    base_url: Option<String>,
    backoff: Option<BackoffConfig>,
    defaults: ChatOptions,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
}

impl BackendAdapterBuilder {
    /// Provider-side model name. Default: the label.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the backend. Default: [`OllamaBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the HTTP client. If not set, one is built with the configured timeout.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Base URL. Default: `http://localhost:11434`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Transport retry budget. Default: [`BackoffConfig::local`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Default sampling options for every request through this adapter.
    pub fn defaults(mut self, options: ChatOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn event_handler(mut self, handler: Option<Arc<dyn EventHandler>>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Request timeout for the built client. Default: 300 seconds.
    ///
    /// Ignored when a custom client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<BackendAdapter> {
        let client = match self.client {
            Some(c) => c,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(300)))
                .build()?,
        };
        Ok(BackendAdapter {
            model: self.model.unwrap_or_else(|| self.label.clone()),
            label: self.label,
            backend: self.backend.unwrap_or_else(|| Arc::new(OllamaBackend)),
            client,
            base_url: self
                .base_url
                .unwrap_or_else(|| Provider::Ollama.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            backoff: self.backoff.unwrap_or_else(BackoffConfig::local),
            defaults: self.defaults,
            event_handler: self.event_handler,
        })
    }
}
