//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and demos call
//! [`init_logging`] once to install a formatter. The `NOVEL_PIPELINE_LOG`
//! environment variable overrides the configured filter.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::Result;
use crate::PipelineError;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable that overrides [`LoggingConfig::level`].
pub const LOG_ENV_VAR: &str = "NOVEL_PIPELINE_LOG";

/// Install the global subscriber.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(config)?;
    let base = Registry::default().with(filter);

    // try_init fails only when a global subscriber already exists.
    let _ = match config.format {
        LogFormat::Json => base
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => base
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    Ok(())
}

/// Build the filter from `NOVEL_PIPELINE_LOG`, falling back to the config.
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV_VAR) {
        return Ok(filter);
    }
    filter_from_directive(&config.level)
}

fn filter_from_directive(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| {
        PipelineError::InvalidConfig(format!("invalid log level '{}': {}", directive, e))
    })
}
