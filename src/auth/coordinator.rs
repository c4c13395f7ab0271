//! Background credential renewal
//!
//! The coordinator owns the current [`Credential`] behind an `Arc` that is
//! swapped whole on every refresh, so readers never block on a refresh and
//! never observe a half-updated value. A background task sleeps until
//! `expires_at - early_refresh_window`, refreshes with bounded retries, and
//! reschedules from the new expiry. When a refresh cycle fails terminally the
//! coordinator moves to [`TokenState::Stopped`] and publishes a fatal
//! [`EngineErrorEvent`] through the handler registry.

use super::{AuthError, Authorizer, Credential};
use crate::config::TokenConfig;
use crate::engine::backoff::BackoffState;
use crate::engine::LifecycleError;
use crate::metrics;
use crate::registry::HandlerRegistry;
use crate::shutdown::{ShutdownCoordinator, SharedShutdown, Wait};
use crate::{EngineErrorEvent, ErrorKind, ErrorSource, Event};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Floor between consecutive background refreshes
const MIN_REFRESH_SPACING: Duration = Duration::from_secs(30);

/// Lifecycle of a [`TokenCoordinator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenState {
    /// Constructed; no background task yet
    Idle,
    /// Background task scheduled; credential is current
    Active,
    /// A refresh is in flight; readers still see the previous credential
    Refreshing,
    /// Stopped by the owner or after a terminal refresh failure
    Stopped,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenState::Idle => "idle",
            TokenState::Active => "active",
            TokenState::Refreshing => "refreshing",
            TokenState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Identifies a registered refresh observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefreshListenerId(u64);

type RefreshCallback = Arc<dyn Fn(&Credential) + Send + Sync>;

struct Inner {
    authorizer: Arc<dyn Authorizer>,
    config: TokenConfig,
    registry: Arc<HandlerRegistry>,
    credential: RwLock<Arc<Credential>>,
    state: Mutex<TokenState>,
    // Serialises refreshes so concurrent callers coalesce onto one exchange.
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: Mutex<SharedShutdown>,
    task: Mutex<Option<JoinHandle<()>>>,
    listeners: RwLock<Vec<(RefreshListenerId, RefreshCallback)>>,
    next_listener_id: AtomicU64,
    rng: Mutex<StdRng>,
}

/// Owns a refreshable credential and renews it ahead of expiry
pub struct TokenCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for TokenCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCoordinator")
            .field("state", &self.state())
            .field("credential", &self.credential())
            .finish()
    }
}

impl TokenCoordinator {
    /// Create a coordinator holding `credential`
    ///
    /// Terminal refresh failures are published to `registry` as
    /// [`Event::EngineError`].
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        credential: Credential,
        config: TokenConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                authorizer,
                config,
                registry,
                credential: RwLock::new(Arc::new(credential)),
                state: Mutex::new(TokenState::Idle),
                refresh_lock: tokio::sync::Mutex::new(()),
                shutdown: Mutex::new(ShutdownCoordinator::shared()),
                task: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                rng: Mutex::new(StdRng::from_os_rng()),
            }),
        }
    }

    /// Seed the retry jitter source
    pub fn with_jitter_seed(self, seed: u64) -> Self {
        *self.inner.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Start the background refresh task. A no-op while one is running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Token refresh task already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        let shutdown = ShutdownCoordinator::shared();
        *self.inner.shutdown.lock() = shutdown.clone();
        *self.inner.state.lock() = TokenState::Active;

        let inner = self.inner.clone();
        *task = Some(runtime.spawn(refresh_loop(inner, shutdown)));
        info!(expires_at = %self.credential().expires_at, "Token refresh task started");
        Ok(())
    }

    /// Cancel the background task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        *self.inner.state.lock() = TokenState::Stopped;
        self.inner.shutdown.lock().request_shutdown();

        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Token refresh task panicked");
                }
            }
            info!("Token refresh task stopped");
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TokenState {
        *self.inner.state.lock()
    }

    /// Latest access token; never waits for an in-flight refresh
    pub fn access_token(&self) -> String {
        self.inner.current().access_token.clone()
    }

    /// Latest credential snapshot
    pub fn credential(&self) -> Arc<Credential> {
        self.inner.current()
    }

    /// Refresh immediately, coalescing with a refresh already in flight
    ///
    /// Returns the credential that is current once the refresh settles.
    pub async fn refresh_now(&self) -> Result<Arc<Credential>, AuthError> {
        let observed = self.inner.current();
        let shutdown = self.inner.shutdown.lock().clone();
        self.inner.refresh(observed, &shutdown).await
    }

    /// Register an observer invoked after every successful refresh
    pub fn on_refreshed<F>(&self, callback: F) -> RefreshListenerId
    where
        F: Fn(&Credential) + Send + Sync + 'static,
    {
        let id = RefreshListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a refresh observer. Removing twice is a no-op.
    pub fn remove_refresh_listener(&self, id: RefreshListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

impl Drop for TokenCoordinator {
    fn drop(&mut self) {
        self.inner.shutdown.lock().request_shutdown();
    }
}

impl Inner {
    fn current(&self) -> Arc<Credential> {
        self.credential.read().clone()
    }

    async fn refresh(
        &self,
        observed: Arc<Credential>,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Arc<Credential>, AuthError> {
        let _guard = match shutdown.run_until_shutdown(self.refresh_lock.lock()).await {
            Some(guard) => guard,
            None => return Err(AuthError::Cancelled),
        };

        let current = self.current();
        if !Arc::ptr_eq(&current, &observed) {
            debug!("Credential already refreshed by a concurrent caller");
            return Ok(current);
        }

        let previous = {
            let mut state = self.state.lock();
            if *state == TokenState::Stopped {
                return Err(AuthError::Stopped);
            }
            std::mem::replace(&mut *state, TokenState::Refreshing)
        };

        match self.refresh_with_retry(&current, shutdown).await {
            Ok(fresh) => {
                let installed = self.install(&current, fresh);
                {
                    let mut state = self.state.lock();
                    if *state == TokenState::Refreshing {
                        *state = previous;
                    }
                }
                self.notify(&installed);
                Ok(installed)
            }
            Err(AuthError::Cancelled) => {
                let mut state = self.state.lock();
                if *state == TokenState::Refreshing {
                    *state = previous;
                }
                Err(AuthError::Cancelled)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn refresh_with_retry(
        &self,
        current: &Credential,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Credential, AuthError> {
        let max_attempts = self.config.max_refresh_attempts.max(1);
        let mut backoff = BackoffState::default();
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            let outcome = shutdown
                .run_until_shutdown(self.authorizer.refresh(&current.refresh_token))
                .await;

            match outcome {
                None => return Err(AuthError::Cancelled),
                Some(Ok(credential)) => {
                    metrics::record_token_refresh("success");
                    return Ok(credential);
                }
                Some(Err(AuthError::Rejected(reason))) => {
                    metrics::record_token_refresh("rejected");
                    warn!(attempt = attempt, reason = %reason, "Refresh token rejected");
                    return Err(AuthError::Rejected(reason));
                }
                Some(Err(e)) => {
                    metrics::record_token_refresh("failure");
                    last = e.to_string();
                    if attempt == max_attempts {
                        break;
                    }

                    let delay = {
                        let mut rng = self.rng.lock();
                        backoff.record_failure(&self.config.backoff, &mut *rng)
                    };
                    metrics::record_retry_backoff(delay, attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        wait_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token refresh failed, retrying"
                    );

                    if shutdown.sleep(delay).await == Wait::Cancelled {
                        return Err(AuthError::Cancelled);
                    }
                }
            }
        }

        Err(AuthError::RefreshExhausted {
            attempts: max_attempts,
            last,
        })
    }

    fn install(&self, previous: &Credential, mut fresh: Credential) -> Arc<Credential> {
        // Authorization servers may omit the refresh token on renewal.
        if fresh.refresh_token.is_empty() {
            fresh.refresh_token = previous.refresh_token.clone();
        }
        let fresh = Arc::new(fresh);
        *self.credential.write() = fresh.clone();
        info!(expires_at = %fresh.expires_at, "Credential refreshed");
        fresh
    }

    fn notify(&self, credential: &Credential) {
        let callbacks: Vec<RefreshCallback> = self
            .listeners
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(credential))).is_err() {
                warn!("Refresh observer panicked");
            }
        }
    }

    fn fail(&self, err: &AuthError) {
        *self.state.lock() = TokenState::Stopped;
        error!(error = %err, "Token refresh failed terminally");
        let event = EngineErrorEvent::new(
            ErrorSource::TokenRefresh,
            ErrorKind::Unauthorized,
            err.to_string(),
            true,
        );
        self.registry.publish(&Event::EngineError(event));
    }
}

async fn refresh_loop(inner: Arc<Inner>, shutdown: SharedShutdown) {
    let mut renewed = false;

    loop {
        let observed = inner.current();
        let window = inner.config.early_refresh_window;
        let wait = next_refresh_wait(&observed, window, renewed, Utc::now());
        if renewed && observed.refresh_deadline(window) <= Utc::now() {
            warn!(
                window_secs = window.as_secs(),
                wait_ms = wait.as_millis() as u64,
                "Renewed credential expires inside the early refresh window"
            );
        }

        debug!(wait_ms = wait.as_millis() as u64, "Next token refresh scheduled");
        if shutdown.sleep(wait).await == Wait::Cancelled {
            return;
        }

        match inner.refresh(observed, &shutdown).await {
            Ok(_) => renewed = true,
            // Terminal failures were already published by `refresh`.
            Err(_) => return,
        }
    }
}

/// Delay before the next background refresh of `credential`
///
/// A credential issued with a lifetime shorter than the early window is
/// renewed halfway to its expiry, and never sooner than
/// [`MIN_REFRESH_SPACING`] after the previous renewal.
fn next_refresh_wait(
    credential: &Credential,
    early_window: Duration,
    renewed: bool,
    now: chrono::DateTime<Utc>,
) -> Duration {
    let until_deadline = (credential.refresh_deadline(early_window) - now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if !renewed || !until_deadline.is_zero() {
        return until_deadline;
    }

    let half_life = (credential.expires_at - now).to_std().unwrap_or(Duration::ZERO) / 2;
    half_life.max(MIN_REFRESH_SPACING)
}
