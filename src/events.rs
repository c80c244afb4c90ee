//! Event hooks for pipeline progress and retries.
//!
//! Provides an optional, non-intrusive way to observe a run. The
//! orchestrator emits stage and chapter events, the generation client emits
//! semantic retry events, and adapters emit transport retry events. Every
//! event is also logged through `tracing`, so a handler is only needed for
//! progress UIs or tests.

use crate::state::Step;
use std::sync::Arc;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A stage function is about to run.
    StageStarted { step: Step },
    /// A disabled optional stage was skipped by advancing its marker.
    StageSkipped { step: Step },
    /// A stage finished and its artifacts were checkpointed.
    StageCompleted { step: Step },
    /// One chapter was generated and checkpointed.
    ChapterCheckpointed {
        /// 1-based chapter index.
        index: usize,
        total: usize,
    },
    /// A semantic retry (unparseable or invalid output) is starting.
    RetryStart {
        /// Model identifier.
        model: String,
        /// The attempt about to be made (2 = first retry).
        attempt: u32,
        reason: String,
    },
    /// A structured-generation call has finished.
    RetryEnd {
        model: String,
        /// Total attempts made.
        attempts: u32,
        success: bool,
    },
    /// A transport-level retry due to an HTTP or connection error.
    TransportRetry {
        model: String,
        /// The retry number (1-indexed).
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
}

/// Handler for run events.
///
/// # Example
///
/// ```
/// use novel_pipeline::events::{Event, EventHandler};
///
/// struct Progress;
///
/// impl EventHandler for Progress {
///     fn on_event(&self, event: Event) {
///         if let Event::ChapterCheckpointed { index, total } = event {
///             println!("chapter {}/{} saved", index, total);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
