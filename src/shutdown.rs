//! Cancellation signalling for the engine's background loops.
//!
//! Each running loop (polling, token refresh) owns one [`ShutdownCoordinator`].
//! The owner requests shutdown; the loop races every suspension point against
//! [`ShutdownCoordinator::wait_for_shutdown`] so stop latency does not depend on
//! how long the loop intended to sleep.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Coordinates cancellation of a single background task.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
}

/// Result of an interruptible wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The full duration (or future) completed.
    Elapsed,
    /// Shutdown was requested first.
    Cancelled,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request shutdown. Notifies all registered waiters exactly once.
    pub fn request_shutdown(&self) {
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request cannot slip
        // between the check and the await.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless shutdown is requested first.
    pub async fn sleep(&self, duration: Duration) -> Wait {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Wait::Elapsed,
            _ = self.wait_for_shutdown() => Wait::Cancelled,
        }
    }

    /// Drive `fut` to completion unless shutdown is requested first.
    ///
    /// Returns `None` when cancelled; the future is dropped at that point.
    pub async fn run_until_shutdown<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            out = fut => Some(out),
            _ = self.wait_for_shutdown() => None,
        }
    }
}
