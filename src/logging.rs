//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! application's call. These helpers install the default layout: an
//! `EnvFilter` read from `RUST_LOG` (falling back to [`DEFAULT_FILTER`]) and
//! JSON output when `LOG_FORMAT=json`.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "livechat_engine=info";

/// Output layout of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` from the environment
    pub fn from_env() -> Self {
        Self::from_value(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn try_init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    result.is_ok()
}

/// Install the global subscriber, ignoring an already-installed one
pub fn init_tracing() {
    if !try_init_tracing() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
