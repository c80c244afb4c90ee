//! Attempt diagnostics for structured generation.
//!
//! [`GenerationDiagnostics`] records what happened during one client call:
//! how many times the model was asked, whether the JSON needed repair, the
//! token usage summed over every attempt, and any violations left in a
//! fallback result.

use crate::backend::Usage;
use crate::schema::Violation;

/// Records what happened during one generation call.
///
/// # Example
///
/// ```
/// use novel_pipeline::diagnostics::GenerationDiagnostics;
///
/// let diag = GenerationDiagnostics::default();
/// assert!(diag.ok());
/// assert_eq!(diag.retries(), 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationDiagnostics {
    /// Backend calls made, including the first one.
    pub attempts: u32,

    /// Whether the accepted JSON went through the tolerant repair pass.
    pub repaired: bool,

    /// Usage accumulated across all attempts.
    pub usage: Usage,

    /// Violations remaining in a result returned by
    /// [`safe_generate_schema_or_last`](crate::client::StructuredClient::safe_generate_schema_or_last).
    /// Empty for validated results.
    pub violations: Vec<Violation>,
}

impl GenerationDiagnostics {
    /// The result satisfied its schema (or had none).
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub(crate) fn record_attempt(&mut self, usage: Usage) {
        self.attempts += 1;
        self.usage += usage;
    }
}
