//! Retry delay calculation
//!
//! `raw = min(max_delay, base_delay * multiplier^attempt)`, then scaled by a
//! uniform factor in `[1 - jitter_fraction, 1 + jitter_fraction]` and floored
//! at zero. The policy is configuration only; callers own the attempt counter
//! ([`BackoffState`]) and the random source.

use crate::config::{
    duration_ms, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_BACKOFF_MS, DEFAULT_JITTER_FRACTION,
    DEFAULT_MAX_BACKOFF_MS,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay for attempt 0, before jitter
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Cap applied before jitter
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor per attempt; must be greater than 1
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter_fraction: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_fraction,
        }
    }

    /// Same policy without jitter
    pub fn without_jitter(self) -> Self {
        Self {
            jitter_fraction: 0.0,
            ..self
        }
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(self.multiplier.is_finite() && self.multiplier > 1.0) {
            return Err(format!(
                "Backoff multiplier must be greater than 1, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "Jitter fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "Base delay ({:?}) must not exceed max delay ({:?})",
                self.base_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Delay for `attempt` before jitter
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Upper bound of any delay this policy can produce
    pub fn max_jittered_delay(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_fraction.clamp(0.0, 1.0))
    }

    /// Jittered delay for `attempt`, drawing from the thread-local generator
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Jittered delay for `attempt`, drawing from `rng`
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.raw_delay(attempt).as_secs_f64();
        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        let secs = (raw * factor).max(0.0);
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_jittered_delay()
        }
    }
}

/// Consecutive-failure counter owned by a retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Failures since the last success
    pub attempt: u32,
    /// Delay chosen after the most recent failure
    pub last_delay: Duration,
}

impl BackoffState {
    /// Record a failure and return the delay to wait before retrying.
    ///
    /// The delay is computed for the attempt count *before* the increment, so
    /// the first failure waits roughly `base_delay`.
    pub fn record_failure<R: Rng>(&mut self, policy: &BackoffPolicy, rng: &mut R) -> Duration {
        let delay = policy.delay_with(self.attempt, rng);
        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    /// Clear after a success
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
