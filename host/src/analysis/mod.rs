//! Analyses: descriptors, in-process logic and the registration table.

pub mod descriptor;
pub mod packaged;
pub mod registry;

pub use descriptor::{AnalysisDescriptor, AnalysisIndex, DescriptorError, KernelKind, INDEX_FILE};
pub use registry::{AnalysisFactory, AnalysisRegistry};

use serde_json::Value;
use thiserror::Error;

/// Outcome of dispatching a signal to an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The analysis has a handler for the signal.
    Handled,
    /// No handler exists; the adapter stores the payload instead.
    Unhandled,
}

/// Errors an analysis handler may report.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The payload does not have the shape the handler expects.
    #[error("invalid payload for '{signal}': {reason}")]
    InvalidPayload {
        /// Signal being handled.
        signal: String,
        /// What was wrong.
        reason: String,
    },
    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
}

/// Collects the events an analysis emits while handling one signal.
#[derive(Debug, Default)]
pub struct Emitter {
    events: Vec<(String, Value)>,
}

impl Emitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `signal` with `payload` for the session being served.
    pub fn emit(&mut self, signal: impl Into<String>, payload: Value) {
        self.events.push((signal.into(), payload));
    }

    /// Returns the queued events in emission order.
    #[must_use]
    pub fn into_events(self) -> Vec<(String, Value)> {
        self.events
    }
}

/// Logic of an in-process analysis. One instance serves one browser session.
pub trait Analysis: Send {
    /// Handles `signal` carrying `payload`, emitting replies through `emit`.
    ///
    /// Lifecycle signals `connect`, `args`, `connected` and `disconnected`
    /// go through this method too.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler fails; the adapter logs it and keeps
    /// the session alive.
    fn on_signal(
        &mut self,
        signal: &str,
        payload: Value,
        emit: &mut Emitter,
    ) -> Result<Dispatch, AnalysisError>;
}
