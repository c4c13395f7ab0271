//! Observability metrics for the live chat engine
//!
//! This module records poll loop health, handler failures, retry behaviour,
//! quota consumption and token refreshes.
//!
//! ## Architecture
//!
//! - Uses the `metrics` facade; the embedding application installs the recorder
//!   (Prometheus, StatsD, ...). Without one every call is a no-op.
//! - Descriptions are registered once per process by [`describe_metrics`].

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        "livechat_fetches_total",
        Unit::Count,
        "Total number of feed page fetches, by outcome"
    );

    describe_histogram!(
        "livechat_fetch_duration_seconds",
        Unit::Seconds,
        "Feed page fetch duration in seconds"
    );

    describe_counter!(
        "livechat_events_published_total",
        Unit::Count,
        "Total number of events published to subscribers, by kind"
    );

    describe_counter!(
        "livechat_items_skipped_total",
        Unit::Count,
        "Feed items that were not published, by reason"
    );

    describe_counter!(
        "livechat_handler_panics_total",
        Unit::Count,
        "Subscriber callbacks that panicked, by event kind"
    );

    describe_histogram!(
        "livechat_backoff_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );

    describe_counter!(
        "livechat_retries_total",
        Unit::Count,
        "Total number of retry attempts"
    );

    describe_gauge!(
        "livechat_quota_used",
        Unit::Count,
        "Quota units consumed since the last reset"
    );

    describe_gauge!(
        "livechat_quota_remaining",
        Unit::Count,
        "Quota units remaining before the daily budget is exhausted"
    );

    describe_counter!(
        "livechat_token_refreshes_total",
        Unit::Count,
        "Credential refresh attempts, by outcome"
    );
});

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Times a single feed page fetch
pub struct FetchMetrics {
    feed_id: String,
    start_time: Instant,
}

impl FetchMetrics {
    /// Start timing a fetch
    pub fn start(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            start_time: Instant::now(),
        }
    }

    /// Record a successful fetch returning `items` raw items
    pub fn record_success(&self, items: usize) {
        let duration = self.start_time.elapsed();
        self.record("success", duration);
        debug!(
            feed_id = %self.feed_id,
            items = items,
            duration_ms = duration.as_millis(),
            "Fetch completed"
        );
    }

    /// Record a failed fetch classified as `kind`
    pub fn record_failure(&self, kind: &str) {
        let duration = self.start_time.elapsed();
        self.record(kind, duration);
        debug!(
            feed_id = %self.feed_id,
            kind = kind,
            duration_ms = duration.as_millis(),
            "Fetch failed"
        );
    }

    fn record(&self, outcome: &str, duration: Duration) {
        counter!(
            "livechat_fetches_total",
            "outcome" => outcome.to_string(),
        )
        .increment(1);

        histogram!("livechat_fetch_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Record one event delivered to the registry
pub fn record_event_published(kind: &str) {
    counter!(
        "livechat_events_published_total",
        "kind" => kind.to_string(),
    )
    .increment(1);
}

/// Record a feed item that was not published
pub fn record_item_skipped(reason: &'static str) {
    counter!(
        "livechat_items_skipped_total",
        "reason" => reason,
    )
    .increment(1);
}

/// Record a panicking subscriber callback
pub fn record_handler_panic(kind: &str) {
    counter!(
        "livechat_handler_panics_total",
        "kind" => kind.to_string(),
    )
    .increment(1);
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!("livechat_retries_total").increment(1);
    histogram!("livechat_backoff_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record quota consumption after a charge
pub fn record_quota(used: u64, limit: u64) {
    let remaining = limit.saturating_sub(used);

    gauge!("livechat_quota_used").set(used as f64);
    gauge!("livechat_quota_remaining").set(remaining as f64);

    // Emit warning if approaching limit
    let usage_percent = if limit == 0 {
        100.0
    } else {
        (used as f64 / limit as f64) * 100.0
    };
    if usage_percent >= 80.0 {
        warn!(
            used = used,
            limit = limit,
            usage_percent = usage_percent,
            "Quota usage exceeds 80% threshold"
        );
    }
}

/// Record a credential refresh attempt
pub fn record_token_refresh(outcome: &'static str) {
    counter!(
        "livechat_token_refreshes_total",
        "outcome" => outcome,
    )
    .increment(1);
}
