use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::schema::Violation;
use crate::state::Step;

/// Errors produced by the pipeline and its components.
///
/// Every retryable category is resolved inside the component that owns it;
/// callers only ever see terminal failures. Use [`PipelineError::kind`] to
/// branch on the category instead of matching individual variants.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The provider answered 2xx but the body did not have the expected shape.
    #[error("{provider} returned an unexpected response: {message}")]
    UnexpectedResponse {
        provider: &'static str,
        message: String,
    },

    /// A transport failure survived every backoff attempt of the adapter.
    #[error("{provider} request failed after {attempts} attempt(s): {source}")]
    TransportExhausted {
        provider: &'static str,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// The model never produced parseable JSON within the attempt bound.
    #[error("model '{model}' produced no parseable JSON after {attempts} attempt(s): {last_error}")]
    MalformedOutput {
        model: String,
        attempts: u32,
        last_error: String,
    },

    /// The model never produced an object satisfying the schema.
    #[error(
        "model '{model}' output failed schema '{schema}' after {attempts} attempt(s): {}",
        format_violations(.violations)
    )]
    SchemaValidation {
        model: String,
        schema: String,
        attempts: u32,
        violations: Vec<Violation>,
    },

    /// A required provider credential was not available.
    #[error("missing credential for provider '{provider}': set {env_var} or configure api_key")]
    MissingCredential {
        provider: &'static str,
        env_var: String,
    },

    /// The provider scheme in a model identifier is not supported.
    #[error("unsupported provider '{0}'")]
    UnsupportedProvider(String),

    /// A model was requested that was never registered with the client.
    #[error("model '{0}' is not registered with the generation client")]
    UnknownModel(String),

    /// Invalid configuration or request detected before any work started.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No checkpoint exists at the given path.
    #[error("checkpoint not found at {}", .0.display())]
    CheckpointMissing(PathBuf),

    /// A checkpoint exists but could not be parsed.
    #[error("checkpoint at {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Reading, writing or renaming the checkpoint failed.
    #[error("checkpoint I/O failed for {}: {source}", path.display())]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Resuming past a stage whose artifact is absent.
    #[error("run state is at '{step}' but artifact '{artifact}' is missing")]
    MissingArtifact { step: Step, artifact: &'static str },

    /// A run state that breaks its own invariants.
    #[error("inconsistent run state: {0}")]
    InconsistentState(String),

    /// A stage function failed with a descriptive message.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

/// Coarse error categories used for retry and abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, HTTP 5xx/429.
    Transport,
    /// Output that could not be parsed as JSON.
    MalformedOutput,
    /// Output that parsed but violated the schema.
    SchemaValidation,
    /// Credentials, providers, models, run state invariants.
    Configuration,
    /// Checkpoint file problems other than a missing file.
    Checkpoint,
    /// Failure raised by a stage function.
    Stage,
}

impl PipelineError {
    /// Shorthand for [`PipelineError::StageFailed`].
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Request(_)
            | PipelineError::HttpError { .. }
            | PipelineError::UnexpectedResponse { .. }
            | PipelineError::TransportExhausted { .. } => ErrorKind::Transport,
            PipelineError::MalformedOutput { .. } => ErrorKind::MalformedOutput,
            PipelineError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            PipelineError::MissingCredential { .. }
            | PipelineError::UnsupportedProvider(_)
            | PipelineError::UnknownModel(_)
            | PipelineError::InvalidConfig(_)
            | PipelineError::CheckpointMissing(_)
            | PipelineError::CheckpointCorrupt { .. }
            | PipelineError::MissingArtifact { .. }
            | PipelineError::InconsistentState(_) => ErrorKind::Configuration,
            PipelineError::CheckpointIo { .. } | PipelineError::Json(_) => ErrorKind::Checkpoint,
            PipelineError::StageFailed { .. } | PipelineError::Other(_) => ErrorKind::Stage,
        }
    }

    /// Whether this error must abort immediately without any retry.
    pub fn is_fatal_config(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Whether an adapter would retry this error under the default backoff
    /// policy (connection failures, 429 and 5xx).
    pub fn is_transport_retryable(&self) -> bool {
        crate::backend::is_retryable(self, &crate::backend::BackoffConfig::default())
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
