//! Poll loop lifecycle state and cursor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a [`super::PollEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    /// No loop is running; `start()` and `reset()` are accepted
    Stopped,
    /// `start()` accepted; the loop task is being spawned
    Starting,
    /// The loop is fetching and publishing
    Running,
    /// Cancellation requested or a fatal error occurred; the loop is winding down
    Stopping,
    /// `reset()` is clearing the cursor and backoff state
    Resetting,
}

impl EngineState {
    /// Whether a loop task may currently exist
    pub fn is_active(self) -> bool {
        matches!(self, EngineState::Starting | EngineState::Running | EngineState::Stopping)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Resetting => "resetting",
        };
        write!(f, "{s}")
    }
}

/// Position in the feed
///
/// `page_token` is opaque and forwarded unchanged on the next fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
    /// Continuation token from the last successful fetch; `None` before the first
    pub page_token: Option<String>,
    /// Clamped interval hint from the last successful fetch
    pub next_poll_interval: Duration,
}

/// Result of [`super::PollEngine::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running loop was stopped
    Stopped,
    /// Nothing was running
    NotRunning,
}
