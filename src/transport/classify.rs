//! Map HTTP failures onto the [`TransportError`] taxonomy.
//!
//! Google APIs report failures as
//! `{"error": {"code": 403, "message": "...", "errors": [{"reason": "quotaExceeded", ...}]}}`.
//! The first `reason` refines the status code.

use super::TransportError;
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Reason and message extracted from an error body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiErrorDetail {
    /// First `errors[].reason`, if any
    pub reason: Option<String>,
    /// Top-level `error.message`, or the raw body when it is not JSON
    pub message: String,
}

/// Extract the reason and message from a Google API error body
pub fn parse_error_body(body: &str) -> ApiErrorDetail {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => ApiErrorDetail {
            reason: envelope
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .find(|r| !r.is_empty()),
            message: envelope.error.message,
        },
        Err(_) => ApiErrorDetail {
            reason: None,
            message: body.chars().take(200).collect(),
        },
    }
}

/// Classify a non-success HTTP response
pub fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let detail = parse_error_body(body);
    let reason = detail.reason.as_deref().unwrap_or("");
    let message = if reason.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), detail.message)
    } else {
        format!("HTTP {} ({reason}): {}", status.as_u16(), detail.message)
    };

    match status.as_u16() {
        401 => TransportError::Unauthorized(message),
        403 => match reason {
            "quotaExceeded" | "dailyLimitExceeded" => TransportError::QuotaExceeded(message),
            "rateLimitExceeded" | "userRateLimitExceeded" => TransportError::Transient(message),
            "liveChatEnded" | "liveChatDisabled" => TransportError::Fatal(message),
            _ => TransportError::Forbidden(message),
        },
        404 => TransportError::NotFound(message),
        408 | 429 => TransportError::Transient(message),
        code if code >= 500 => TransportError::Transient(message),
        _ => TransportError::Fatal(message),
    }
}

/// Classify a request that failed before a status was received
pub fn classify_request_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Transient(format!("network error: {err}"))
    } else if err.is_decode() {
        TransportError::Transient(format!("failed to decode response: {err}"))
    } else if err.is_builder() {
        TransportError::Fatal(format!("invalid request: {err}"))
    } else {
        TransportError::Transient(format!("network error: {err}"))
    }
}
