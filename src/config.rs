//! Engine configuration and defaults
//!
//! Every tunable has a named default constant. The config structs deserialize
//! with `#[serde(default)]`, so a partial JSON document only overrides what it
//! names; durations are expressed in integer milliseconds.

use crate::engine::backoff::BackoffPolicy;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Lower clamp for the feed's polling interval hint (1 second).
pub const DEFAULT_MIN_POLL_INTERVAL_MS: u64 = 1_000;

/// Upper clamp for the feed's polling interval hint (30 seconds).
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 30_000;

/// Initial backoff delay (1 second).
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;

/// Backoff cap before jitter (60 seconds).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

/// Growth factor between consecutive backoff delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of the delay randomised in either direction.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

/// Consecutive unauthorized fetches tolerated after successful refreshes.
pub const DEFAULT_MAX_UNAUTHORIZED_RETRIES: u32 = 3;

/// Refresh the credential this long before it expires (5 minutes).
pub const DEFAULT_EARLY_REFRESH_WINDOW_SECS: u64 = 300;

/// Refresh attempts before the coordinator gives up.
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 5;

/// Daily quota budget in cost units.
pub const DEFAULT_DAILY_QUOTA: u64 = 10_000;

/// Time zone of the quota reset boundary ("Pacific midnight").
pub const DEFAULT_RESET_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

/// Hour of day (in [`DEFAULT_RESET_TIMEZONE`]) at which quota resets.
pub const DEFAULT_RESET_HOUR: u32 = 0;

/// Per-request timeout for the HTTP transport and authorizer.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds an out-of-range value
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    /// Lower bound applied to the feed's interval hint
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
    /// Upper bound applied to the feed's interval hint
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    /// Retry delay policy for failed fetches
    pub backoff: BackoffPolicy,
    /// Unauthorized fetches tolerated in a row, each after a successful refresh
    pub max_unauthorized_retries: u32,
    /// Wait for the quota reset instead of terminating on quota exhaustion
    pub pause_on_quota_exhausted: bool,
    /// Fixed seed for backoff jitter; random when unset
    pub jitter_seed: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(DEFAULT_MIN_POLL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_MAX_POLL_INTERVAL_MS),
            backoff: BackoffPolicy::default(),
            max_unauthorized_retries: DEFAULT_MAX_UNAUTHORIZED_RETRIES,
            pause_on_quota_exhausted: true,
            jitter_seed: None,
        }
    }
}

impl PollConfig {
    /// Clamp a server-supplied interval hint into `[min_interval, max_interval]`
    ///
    /// An inverted range yields `max_interval` rather than panicking.
    pub fn clamp_interval(&self, hint: Duration) -> Duration {
        hint.max(self.min_interval).min(self.max_interval)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::Invalid(format!(
                "min_interval ({:?}) must not exceed max_interval ({:?})",
                self.min_interval, self.max_interval
            )));
        }
        self.backoff.validate().map_err(ConfigError::Invalid)
    }
}

/// Token refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    /// How long before expiry the background refresh fires
    #[serde(with = "duration_ms")]
    pub early_refresh_window: Duration,
    /// Attempts per refresh cycle before giving up
    pub max_refresh_attempts: u32,
    /// Delay policy between refresh attempts
    pub backoff: BackoffPolicy,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            early_refresh_window: Duration::from_secs(DEFAULT_EARLY_REFRESH_WINDOW_SECS),
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl TokenConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_refresh_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_refresh_attempts must be at least 1".to_string(),
            ));
        }
        self.backoff.validate().map_err(ConfigError::Invalid)
    }
}

/// Quota budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Units available per day
    pub daily_limit: u64,
    /// Time zone of the reset boundary, independent of the host zone
    pub reset_timezone: Tz,
    /// Hour of day (0-23) in `reset_timezone` at which usage resets
    pub reset_hour: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_QUOTA,
            reset_timezone: DEFAULT_RESET_TIMEZONE,
            reset_hour: DEFAULT_RESET_HOUR,
        }
    }
}

impl QuotaConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_limit == 0 {
            return Err(ConfigError::Invalid("daily_limit must be positive".to_string()));
        }
        if self.reset_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "reset_hour must be 0-23, got {}",
                self.reset_hour
            )));
        }
        Ok(())
    }
}

/// Full configuration for a [`crate::ChatBot`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    /// Poll loop settings
    pub poll: PollConfig,
    /// Token refresh settings
    pub token: TokenConfig,
    /// Quota settings
    pub quota: QuotaConfig,
}

impl BotConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `LIVECHAT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "LIVECHAT_MIN_INTERVAL_MS")? {
            config.poll.min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "LIVECHAT_MAX_INTERVAL_MS")? {
            config.poll.max_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<u64, _>(&lookup, "LIVECHAT_DAILY_QUOTA")? {
            config.quota.daily_limit = limit;
        }
        if let Some(tz) = parse_var::<Tz, _>(&lookup, "LIVECHAT_RESET_TZ")? {
            config.quota.reset_timezone = tz;
        }
        if let Some(hour) = parse_var::<u32, _>(&lookup, "LIVECHAT_RESET_HOUR")? {
            config.quota.reset_hour = hour;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "LIVECHAT_EARLY_REFRESH_SECS")? {
            config.token.early_refresh_window = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll.validate()?;
        self.token.validate()?;
        self.quota.validate()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
