//! Scripted backend for testing without a live LLM.
//!
//! [`MockBackend`] plays back a script of replies and transport failures in
//! order and records every request it receives, so tests can assert on
//! call counts, seeds and the exact message history sent on each attempt.
//!
//! # Example
//!
//! ```
//! use novel_pipeline::backend::{MockBackend, MockStep};
//!
//! let mock = MockBackend::new(vec![
//!     MockStep::http(503),
//!     MockStep::text(r#"{"title": "Dawn"}"#),
//! ]);
//! assert_eq!(mock.calls(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, Usage};
use crate::error::Result;
use crate::PipelineError;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Reply with this text.
    Text(String),
    /// Fail with an HTTP error of this status.
    Http(u16),
}

impl MockStep {
    pub fn text(text: impl Into<String>) -> Self {
        MockStep::Text(text.into())
    }

    pub fn http(status: u16) -> Self {
        MockStep::Http(status)
    }
}

/// A test backend that plays back scripted steps in order.
///
/// Cycles back to the beginning when the script is exhausted.
#[derive(Debug)]
pub struct MockBackend {
    script: Vec<MockStep>,
    index: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    /// Create a mock backend with the given script.
    pub fn new(script: Vec<MockStep>) -> Self {
        Self {
            script,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that replies with each text in turn.
    pub fn replies<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(MockStep::text).collect())
    }

    /// Create a mock that always returns the same reply.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![MockStep::text(response)])
    }

    /// Number of chat and embed calls received so far.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    /// Every chat request received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_step(&self) -> Result<MockStep> {
        if self.script.is_empty() {
            return Err(PipelineError::Other("MockBackend has an empty script".into()));
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.script.len();
        Ok(self.script[idx].clone())
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        match self.next_step()? {
            MockStep::Text(text) => Ok(ChatResponse {
                usage: Usage {
                    prompt_tokens: request.messages.iter().map(|m| word_count(&m.content)).sum(),
                    completion_tokens: word_count(&text),
                },
                text,
            }),
            MockStep::Http(status) => Err(PipelineError::HttpError {
                status,
                body: "scripted failure".into(),
                retry_after: None,
            }),
        }
    }

    /// Deterministic two-dimensional vectors: `[chars, words]`.
    async fn embed(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &EmbedRequest,
    ) -> Result<EmbedResponse> {
        if let MockStep::Http(status) = self.next_step()? {
            return Err(PipelineError::HttpError {
                status,
                body: "scripted failure".into(),
                retry_after: None,
            });
        }
        Ok(EmbedResponse {
            vectors: request
                .input
                .iter()
                .map(|t| vec![t.chars().count() as f32, word_count(t) as f32])
                .collect(),
            usage: Usage {
                prompt_tokens: request.input.iter().map(|t| word_count(t)).sum(),
                completion_tokens: 0,
            },
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatMessage, ChatOptions, FormatHint};

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "test".into(),
            messages: vec![ChatMessage::user(text)],
            options: ChatOptions::default().with_seed(1),
            format: FormatHint::None,
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_script() {
        let mock = MockBackend::new(vec![MockStep::text("first"), MockStep::http(503)]);
        let client = Client::new();
        let r1 = mock.complete(&client, "http://unused", &request("a")).await;
        let r2 = mock.complete(&client, "http://unused", &request("b")).await;
        let r3 = mock.complete(&client, "http://unused", &request("c")).await;
        assert_eq!(r1.unwrap().text, "first");
        assert!(matches!(r2, Err(PipelineError::HttpError { status: 503, .. })));
        assert_eq!(r3.unwrap().text, "first");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let mock = MockBackend::fixed("ok");
        let client = Client::new();
        mock.complete(&client, "http://unused", &request("two words"))
            .await
            .unwrap();
        let recorded = mock.requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].messages[0].content, "two words");
        assert_eq!(recorded[0].options.seed, Some(1));
    }

    #[tokio::test]
    async fn test_mock_usage_and_embed() {
        let mock = MockBackend::fixed("one two three");
        let client = Client::new();
        let resp = mock
            .complete(&client, "http://unused", &request("a b"))
            .await
            .unwrap();
        assert_eq!(resp.usage.prompt_tokens, 2);
        assert_eq!(resp.usage.completion_tokens, 3);

        let embed = mock
            .embed(
                &client,
                "http://unused",
                &EmbedRequest {
                    model: "test".into(),
                    input: vec!["hello there".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(embed.vectors, vec![vec![11.0, 2.0]]);
    }

    #[tokio::test]
    async fn test_empty_script_errors() {
        let mock = MockBackend::new(Vec::new());
        let client = Client::new();
        assert!(mock.complete(&client, "x", &request("a")).await.is_err());
    }
}
