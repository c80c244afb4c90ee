//! Transport-level retry with linear backoff and jitter.
//!
//! [`BackoffConfig`] controls how transient HTTP errors (429, 5xx, connection
//! failures) are retried inside a backend adapter. Local Ollama gets a short
//! budget ([`BackoffConfig::local`]); hosted APIs get a longer one
//! ([`BackoffConfig::cloud`]).

use crate::provider::Provider;
use std::time::Duration;

/// Configuration for transport-level retry.
///
/// The delay before retry `n` (1-based) is `step * n`, jittered and then
/// capped at `max_delay`.
///
/// # Example
///
/// ```
/// use novel_pipeline::backend::BackoffConfig;
/// use std::time::Duration;
///
/// let local = BackoffConfig::local();
/// assert_eq!(local.max_retries, 2);
///
/// let cloud = BackoffConfig::cloud();
/// assert_eq!(cloud.max_retries, 4);
/// assert_eq!(cloud.step, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries after the first attempt.
    pub max_retries: u32,

    /// Linear step. Retry `n` waits roughly `step * n`.
    pub step: Duration,

    /// Upper bound for any single delay. Default: 60 seconds.
    pub max_delay: Duration,

    /// Jitter strategy. Default: [`JitterStrategy::Symmetric`].
    pub jitter: JitterStrategy,

    /// HTTP status codes that trigger retry. Default: `[429, 500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Whether to honour a `Retry-After` header from the provider.
    pub respect_retry_after: bool,
}

/// Jitter applied to the linear delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,

    /// Uniform in `[0, delay]`.
    Full,

    /// Uniform in `[delay / 2, delay * 3 / 2]` (±50%).
    Symmetric,
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::cloud()
        }
    }

    /// Locally hosted backend: 2 retries, 2 s step.
    pub fn local() -> Self {
        Self {
            max_retries: 2,
            ..Self::cloud()
        }
    }

    /// Hosted API: 4 retries, 2 s step, 60 s cap, honours Retry-After.
    pub fn cloud() -> Self {
        Self {
            max_retries: 4,
            step: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Symmetric,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Default budget for a provider.
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Ollama => Self::local(),
            Provider::OpenAi | Provider::OpenRouter | Provider::Google => Self::cloud(),
        }
    }

    /// Override the retry count and step, keeping everything else.
    pub fn with_budget(mut self, max_retries: u32, step: Duration) -> Self {
        self.max_retries = max_retries;
        self.step = step;
        self
    }

    /// Calculate the delay before retry `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.step.as_secs_f64() * f64::from(attempt.max(1));

        let jittered = match self.jitter {
            JitterStrategy::None => base,
            JitterStrategy::Full => fastrand::f64() * base,
            JitterStrategy::Symmetric => base * (0.5 + fastrand::f64()),
        };

        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry `attempt`, preferring a server-supplied `Retry-After`.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(ra) if self.respect_retry_after => ra.min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::cloud()
    }
}
