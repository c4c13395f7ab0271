//! Poll loop, retry backoff, quota accounting and lifecycle state.

pub mod backoff;
pub mod poll;
pub mod quota;
pub mod state;

pub use backoff::{BackoffPolicy, BackoffState};
pub use poll::PollEngine;
pub use quota::{QuotaListenerId, QuotaSnapshot, QuotaTracker};
pub use state::{EngineState, PollCursor, StopOutcome};

/// Lifecycle errors returned by [`PollEngine`]
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Operation requires the engine to be stopped
    #[error("engine is already running (state: {state})")]
    AlreadyRunning {
        /// State observed when the call was rejected
        state: EngineState,
    },

    /// `start()` was called outside a Tokio runtime
    #[error("no tokio runtime available to spawn the poll loop")]
    NoRuntime,
}
