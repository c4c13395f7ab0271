//! Integration tests for logging and tracing

use livechat_engine::logging::{try_init_tracing, LogFormat, DEFAULT_FILTER};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[test]
fn test_default_filter_parses() {
    assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
}

#[test]
fn test_tracing_with_different_log_levels() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("livechat_engine=trace"))
        .with_test_writer()
        .try_init();

    info!(feed_id = "chat", "This is an info message");
    warn!(attempt = 2, "This is a warning message");
    error!(kind = "fatal", "This is an error message");
}

#[test]
fn test_repeated_init_is_harmless() {
    // The first call may race with other tests installing a subscriber.
    let _ = try_init_tracing();
    assert!(!try_init_tracing());
}

#[test]
fn test_log_format_defaults_to_text() {
    if std::env::var("LOG_FORMAT").is_err() {
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }
}
