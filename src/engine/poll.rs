//! Feed polling state machine
//!
//! ```text
//! Stopped --start()--> Starting --> Running --stop()/fatal--> Stopping --> Stopped
//! Stopped --reset()--> Resetting --> Stopped
//! ```
//!
//! One loop iteration charges the fetch cost, fetches the page after the
//! current cursor, publishes decoded events in feed order, then sleeps for the
//! clamped interval hint (on success) or a backoff delay (on failure). Every
//! suspension point races the engine's shutdown signal, so `stop()` latency
//! does not depend on the remaining wait.
//!
//! Failures never escape the loop. They are published as
//! [`Event::EngineError`]; the loop ends with exactly one
//! [`Event::ConnectionClosed`].

use super::backoff::BackoffState;
use super::quota::QuotaTracker;
use super::state::{EngineState, PollCursor, StopOutcome};
use super::LifecycleError;
use crate::auth::TokenCoordinator;
use crate::config::PollConfig;
use crate::metrics::{self, FetchMetrics};
use crate::registry::HandlerRegistry;
use crate::shutdown::{ShutdownCoordinator, SharedShutdown, Wait};
use crate::transport::endpoints::FETCH_COST;
use crate::transport::{ItemParser, Transport, TransportError};
use crate::{
    CloseReason, ConnectionClosed, ConnectionOpened, EngineErrorEvent, ErrorKind, ErrorSource, Event,
};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Progress {
    cursor: PollCursor,
    backoff: BackoffState,
}

struct LoopHandle {
    shutdown: SharedShutdown,
    join: JoinHandle<()>,
}

/// What the loop does after handling a failed fetch
enum Flow {
    Wait(Duration),
    Close(CloseReason),
}

struct Inner {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenCoordinator>,
    quota: Arc<QuotaTracker>,
    registry: Arc<HandlerRegistry>,
    config: PollConfig,
    state: watch::Sender<EngineState>,
    progress: Mutex<Progress>,
    rng: Mutex<StdRng>,
    // Held across start/stop/reset transitions.
    lifecycle: Mutex<Option<LoopHandle>>,
}

/// Polls one feed and publishes its items through a [`HandlerRegistry`]
pub struct PollEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PollEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollEngine")
            .field("feed_id", &self.inner.transport.feed_id())
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}

impl PollEngine {
    /// Create a stopped engine
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenCoordinator>,
        quota: Arc<QuotaTracker>,
        registry: Arc<HandlerRegistry>,
        config: PollConfig,
    ) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (state, _) = watch::channel(EngineState::Stopped);

        Self {
            inner: Arc::new(Inner {
                transport,
                tokens,
                quota,
                registry,
                config,
                state,
                progress: Mutex::new(Progress::default()),
                rng: Mutex::new(rng),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// Spawn the poll loop on the current Tokio runtime
    ///
    /// # Errors
    /// [`LifecycleError::AlreadyRunning`] unless the engine is `Stopped`;
    /// [`LifecycleError::NoRuntime`] outside a runtime.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let current = self.state();
        if current != EngineState::Stopped {
            return Err(LifecycleError::AlreadyRunning { state: current });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        self.inner.state.send_replace(EngineState::Starting);
        let shutdown = ShutdownCoordinator::shared();
        let join = runtime.spawn(run(self.inner.clone(), shutdown.clone()));
        *lifecycle = Some(LoopHandle { shutdown, join });

        // The loop may already have failed and finished; never resurrect it.
        self.inner.state.send_if_modified(|state| {
            if *state == EngineState::Starting {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });

        info!(feed_id = %self.feed_id(), "Poll engine started");
        Ok(())
    }

    /// Cancel the loop and wait until it has published `ConnectionClosed`
    ///
    /// Returns [`StopOutcome::NotRunning`] when already stopped; repeated
    /// calls publish nothing further.
    pub async fn stop(&self) -> StopOutcome {
        let handle = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let current = self.state();
            if matches!(current, EngineState::Stopped | EngineState::Resetting) {
                lifecycle.take();
                debug!(state = %current, "Stop requested but engine is not running");
                return StopOutcome::NotRunning;
            }
            if current != EngineState::Stopping {
                self.inner.state.send_replace(EngineState::Stopping);
            }
            lifecycle.take()
        };

        if let Some(handle) = handle {
            handle.shutdown.request_shutdown();
            if let Err(e) = handle.join.await {
                error!(error = %e, "Poll loop terminated abnormally");
                self.inner.finish(CloseReason::Aborted);
            }
        }

        // A concurrent stop() may own the handle; wait for its outcome.
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == EngineState::Stopped).await;
        info!(feed_id = %self.feed_id(), "Poll engine stopped");
        StopOutcome::Stopped
    }

    /// Clear the cursor and backoff state
    ///
    /// # Errors
    /// [`LifecycleError::AlreadyRunning`] unless the engine is `Stopped`.
    pub fn reset(&self) -> Result<(), LifecycleError> {
        let _lifecycle = self.inner.lifecycle.lock();
        let current = self.state();
        if current != EngineState::Stopped {
            return Err(LifecycleError::AlreadyRunning { state: current });
        }

        self.inner.state.send_replace(EngineState::Resetting);
        *self.inner.progress.lock() = Progress::default();
        self.inner.state.send_replace(EngineState::Stopped);
        debug!(feed_id = %self.feed_id(), "Poll engine reset");
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the feed cursor
    pub fn cursor(&self) -> PollCursor {
        self.inner.progress.lock().cursor.clone()
    }

    /// Snapshot of the retry counter
    pub fn backoff_state(&self) -> BackoffState {
        self.inner.progress.lock().backoff
    }

    /// Feed being polled
    pub fn feed_id(&self) -> &str {
        self.inner.transport.feed_id()
    }
}

impl Drop for PollEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lifecycle.lock().as_ref() {
            handle.shutdown.request_shutdown();
        }
    }
}

async fn run(inner: Arc<Inner>, shutdown: SharedShutdown) {
    // A panic inside the loop still ends with `ConnectionClosed`.
    let worker = {
        let inner = inner.clone();
        tokio::spawn(async move { inner.poll_loop(&shutdown).await })
    };

    let reason = match worker.await {
        Ok(reason) => reason,
        Err(e) => {
            error!(error = %e, panicked = e.is_panic(), "Poll loop terminated abnormally");
            inner.publish_error(ErrorKind::Fatal, format!("poll loop aborted: {e}"), true);
            CloseReason::Aborted
        }
    };
    inner.finish(reason);
}

impl Inner {
    async fn poll_loop(&self, shutdown: &ShutdownCoordinator) -> CloseReason {
        let feed_id = self.transport.feed_id().to_string();
        self.registry.publish(&Event::ConnectionOpened(ConnectionOpened {
            at: Utc::now(),
            feed_id: feed_id.clone(),
        }));

        let mut unauthorized_streak = 0u32;

        loop {
            if shutdown.is_shutdown_requested() {
                return CloseReason::Requested;
            }

            let page_token = self.progress.lock().cursor.page_token.clone();
            let credential = self.tokens.credential();
            self.quota.add(FETCH_COST);

            let timer = FetchMetrics::start(feed_id.as_str());
            let fetch = self.transport.fetch_page(page_token.as_deref(), &credential);
            let Some(result) = shutdown.run_until_shutdown(fetch).await else {
                return CloseReason::Requested;
            };

            let wait = match result {
                Ok(page) => {
                    timer.record_success(page.items.len());
                    unauthorized_streak = 0;

                    let decoded = ItemParser::decode_page(&page, Utc::now());
                    for event in &decoded.events {
                        self.registry.publish(event);
                    }

                    let interval = self.config.clamp_interval(page.interval_hint);
                    {
                        let mut progress = self.progress.lock();
                        if let Some(next) = page.next_page_token {
                            progress.cursor.page_token = Some(next);
                        }
                        progress.cursor.next_poll_interval = interval;
                        progress.backoff.reset();
                    }

                    if decoded.ended {
                        info!(feed_id = %feed_id, "Feed reported end of chat");
                        return CloseReason::FeedEnded;
                    }

                    debug!(
                        published = decoded.events.len(),
                        skipped = decoded.skipped + decoded.malformed,
                        wait_ms = interval.as_millis() as u64,
                        "Poll iteration complete"
                    );
                    interval
                }
                Err(err) => {
                    timer.record_failure(&err.kind().to_string());
                    match self.handle_failure(err, &mut unauthorized_streak, shutdown).await {
                        Flow::Wait(delay) => delay,
                        Flow::Close(reason) => return reason,
                    }
                }
            };

            if shutdown.sleep(wait).await == Wait::Cancelled {
                return CloseReason::Requested;
            }
        }
    }

    async fn handle_failure(
        &self,
        err: TransportError,
        unauthorized_streak: &mut u32,
        shutdown: &ShutdownCoordinator,
    ) -> Flow {
        let kind = err.kind();

        match err {
            TransportError::Transient(_) | TransportError::NotFound(_) | TransportError::Forbidden(_) => {
                let (attempt, delay) = self.record_failure();
                metrics::record_retry_backoff(delay, attempt);
                warn!(
                    kind = %kind,
                    attempt = attempt,
                    wait_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fetch failed, backing off"
                );
                self.publish_error(kind, err.to_string(), false);
                Flow::Wait(delay)
            }
            TransportError::Unauthorized(_) => {
                self.bump_attempt(Duration::ZERO);
                *unauthorized_streak += 1;
                if *unauthorized_streak > self.config.max_unauthorized_retries {
                    error!(
                        streak = *unauthorized_streak,
                        "Credential rejected after repeated refreshes"
                    );
                    self.publish_error(kind, err.to_string(), true);
                    return Flow::Close(CloseReason::Error(kind));
                }

                let Some(refreshed) = shutdown.run_until_shutdown(self.tokens.refresh_now()).await else {
                    return Flow::Close(CloseReason::Requested);
                };
                match refreshed {
                    Ok(_) => {
                        info!(streak = *unauthorized_streak, "Credential refreshed after rejection");
                        self.publish_error(kind, err.to_string(), false);
                        Flow::Wait(Duration::ZERO)
                    }
                    Err(auth_err) => {
                        error!(error = %auth_err, "Credential refresh failed");
                        self.publish_error(kind, format!("{err}; refresh failed: {auth_err}"), true);
                        Flow::Close(CloseReason::Error(kind))
                    }
                }
            }
            TransportError::QuotaExceeded(_) => {
                if !self.config.pause_on_quota_exhausted {
                    error!(error = %err, "Quota exhausted");
                    self.publish_error(kind, err.to_string(), true);
                    return Flow::Close(CloseReason::Error(kind));
                }

                let reset_at = self.quota.reset_at();
                let wait = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.bump_attempt(wait);
                warn!(
                    reset_at = %reset_at,
                    wait_ms = wait.as_millis() as u64,
                    "Quota exhausted, pausing until reset"
                );
                self.publish_error(kind, err.to_string(), false);
                Flow::Wait(wait)
            }
            TransportError::Fatal(_) => {
                error!(error = %err, "Fatal fetch error");
                self.publish_error(kind, err.to_string(), true);
                Flow::Close(CloseReason::Error(kind))
            }
        }
    }

    /// Increment the attempt counter and draw the next backoff delay
    fn record_failure(&self) -> (u32, Duration) {
        let mut rng = self.rng.lock();
        let mut progress = self.progress.lock();
        let delay = progress
            .backoff
            .record_failure(&self.config.backoff, &mut *rng);
        (progress.backoff.attempt, delay)
    }

    fn bump_attempt(&self, wait: Duration) {
        let mut progress = self.progress.lock();
        progress.backoff.attempt = progress.backoff.attempt.saturating_add(1);
        progress.backoff.last_delay = wait;
    }

    fn publish_error(&self, kind: ErrorKind, message: String, fatal: bool) {
        let event = EngineErrorEvent::new(ErrorSource::Fetch, kind, message, fatal);
        self.registry.publish(&Event::EngineError(event));
    }

    fn finish(&self, reason: CloseReason) {
        self.state.send_replace(EngineState::Stopping);
        self.registry.publish(&Event::ConnectionClosed(ConnectionClosed {
            at: Utc::now(),
            feed_id: self.transport.feed_id().to_string(),
            reason,
        }));
        self.state.send_replace(EngineState::Stopped);
        info!(reason = ?reason, "Poll loop finished");
    }
}
