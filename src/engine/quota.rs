//! Daily quota accounting
//!
//! Tracks cost units consumed against a daily budget that resets at a fixed
//! wall-clock hour in a fixed time zone (Pacific midnight by default). Going
//! over the limit is not an error here; upstream rejections surface as
//! [`crate::transport::TransportError::QuotaExceeded`].

use crate::config::QuotaConfig;
use crate::metrics;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of quota usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Units consumed since the last reset
    pub used: u64,
    /// Daily budget
    pub limit: u64,
    /// Next reset boundary
    pub reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    /// Units left before the budget is exhausted
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Whether the budget has been used up
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    used: u64,
    reset_at: DateTime<Utc>,
}

impl Usage {
    fn snapshot(&self, limit: u64) -> QuotaSnapshot {
        QuotaSnapshot {
            used: self.used,
            limit,
            reset_at: self.reset_at,
        }
    }
}

/// Identifies a registered quota listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaListenerId(u64);

type QuotaCallback = Arc<dyn Fn(QuotaSnapshot) + Send + Sync>;

/// Thread-safe quota counter with scheduled reset
pub struct QuotaTracker {
    limit: u64,
    reset_timezone: Tz,
    reset_hour: u32,
    // `used` and `reset_at` change together; only snapshot copies leave the lock.
    usage: RwLock<Usage>,
    listeners: RwLock<Vec<(QuotaListenerId, QuotaCallback)>>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("snapshot", &self.remaining())
            .field("reset_timezone", &self.reset_timezone)
            .field("reset_hour", &self.reset_hour)
            .finish()
    }
}

impl QuotaTracker {
    /// Create a tracker whose first reset is the next boundary after now
    pub fn new(config: &QuotaConfig) -> Self {
        Self::starting_at(config, Utc::now())
    }

    /// Create a tracker as if constructed at `now`
    pub fn starting_at(config: &QuotaConfig, now: DateTime<Utc>) -> Self {
        let reset_at = next_reset_after(now, config.reset_timezone, config.reset_hour);
        Self {
            limit: config.daily_limit.max(1),
            reset_timezone: config.reset_timezone,
            reset_hour: config.reset_hour,
            usage: RwLock::new(Usage { used: 0, reset_at }),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Charge `cost` units, resetting first if the boundary has passed
    pub fn add(&self, cost: u64) -> QuotaSnapshot {
        self.add_at(cost, Utc::now())
    }

    /// Charge `cost` units as of `now`
    pub fn add_at(&self, cost: u64, now: DateTime<Utc>) -> QuotaSnapshot {
        let snapshot = {
            let mut usage = self.usage.write();
            self.reset_if_due(&mut usage, now);
            usage.used = usage.used.saturating_add(cost);
            usage.snapshot(self.limit)
        };

        debug!(cost, used = snapshot.used, limit = snapshot.limit, "Quota charged");
        metrics::record_quota(snapshot.used, snapshot.limit);
        self.notify(snapshot);
        snapshot
    }

    /// Current usage
    ///
    /// Used units and the reset boundary always come from the same period.
    /// Readers only wait out a charge in progress, never a listener.
    pub fn remaining(&self) -> QuotaSnapshot {
        self.usage.read().snapshot(self.limit)
    }

    /// Next reset boundary
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.usage.read().reset_at
    }

    /// Apply a reset if `now` has reached the boundary. Returns whether one happened.
    pub fn reset_if_due_at(&self, now: DateTime<Utc>) -> bool {
        let mut usage = self.usage.write();
        self.reset_if_due(&mut usage, now)
    }

    /// Register a callback invoked with the post-update snapshot after every charge
    pub fn on_update<F>(&self, callback: F) -> QuotaListenerId
    where
        F: Fn(QuotaSnapshot) + Send + Sync + 'static,
    {
        let id = QuotaListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a listener. Removing twice is a no-op; returns whether it was present.
    pub fn remove_listener(&self, id: QuotaListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn reset_if_due(&self, usage: &mut Usage, now: DateTime<Utc>) -> bool {
        if now < usage.reset_at {
            return false;
        }
        let next = next_reset_after(now, self.reset_timezone, self.reset_hour);
        let previous = std::mem::replace(usage, Usage { used: 0, reset_at: next });
        info!(previous_used = previous.used, next_reset = %next, "Quota reset");
        true
    }

    fn notify(&self, snapshot: QuotaSnapshot) {
        // Snapshot the callbacks so none runs under the listener lock.
        let callbacks: Vec<QuotaCallback> = self
            .listeners
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                warn!(used = snapshot.used, "Quota listener panicked");
            }
        }
    }
}

/// First instant strictly after `now` at `hour:00` local time in `tz`.
///
/// When DST skips that hour, the first valid instant after it is used.
pub fn next_reset_after(now: DateTime<Utc>, tz: Tz, hour: u32) -> DateTime<Utc> {
    let hour = hour.min(23);
    let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
        return now + chrono::Duration::days(1);
    };

    let mut date = now.with_timezone(&tz).date_naive();
    // Yesterday's boundary can never be after now; today's or tomorrow's will be.
    for _ in 0..3 {
        let naive = date.and_time(time);
        let candidate = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest());

        if let Some(candidate) = candidate {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }

        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    now + chrono::Duration::days(1)
}
