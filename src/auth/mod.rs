//! Credentials and token refresh
//!
//! A [`Credential`] is immutable once built; [`coordinator::TokenCoordinator`]
//! replaces the whole value on every refresh. The [`Authorizer`] trait is the
//! seam to whatever issues new credentials (see [`oauth::OAuthAuthorizer`]).

pub mod coordinator;
pub mod oauth;

pub use coordinator::{RefreshListenerId, TokenCoordinator, TokenState};
pub use oauth::OAuthAuthorizer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Access credential issued by an authorization server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token sent with every request
    pub access_token: String,
    /// Instant after which `access_token` is rejected
    pub expires_at: DateTime<Utc>,
    /// Long-lived token used to obtain the next credential
    pub refresh_token: String,
    /// Granted scopes
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Credential {
    /// Build a credential
    pub fn new(
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        refresh_token: impl Into<String>,
        scopes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
            refresh_token: refresh_token.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Whether the access token has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Instant at which a proactive refresh should fire
    pub fn refresh_deadline(&self, early_window: Duration) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(early_window).unwrap_or(chrono::Duration::zero());
        self.expires_at - window
    }

    /// Whether `scope` was granted
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &"<redacted>")
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Token refresh errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// Temporary failure; the refresh may succeed if retried
    #[error("transient refresh failure: {0}")]
    Transient(String),

    /// The refresh token was rejected; retrying will not help
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    /// Every attempt in a refresh cycle failed
    #[error("token refresh failed after {attempts} attempts: {last}")]
    RefreshExhausted {
        /// Attempts made
        attempts: u32,
        /// Last failure message
        last: String,
    },

    /// The coordinator was stopped while the refresh was in flight
    #[error("token refresh cancelled")]
    Cancelled,

    /// The coordinator is stopped
    #[error("token coordinator is stopped")]
    Stopped,
}

impl AuthError {
    /// Check if the error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }
}

/// Issues a new credential from a refresh token
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Exchange `refresh_token` for a fresh credential
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError>;
}
