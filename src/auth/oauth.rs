//! OAuth 2.0 refresh-token grant
//!
//! Posts `grant_type=refresh_token` to a token endpoint and maps the response
//! into a [`Credential`]. Status handling:
//! - 2xx: parse `access_token`, `expires_in`, optional `refresh_token`, `scope`
//! - 400/401 with `invalid_grant` or `invalid_client`: [`AuthError::Rejected`]
//! - 429, 5xx, timeouts and connection failures: [`AuthError::Transient`]
//! - anything else: [`AuthError::Rejected`]

use super::{AuthError, Authorizer, Credential};
use crate::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Google's OAuth 2.0 token endpoint
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`Authorizer`] implementing the refresh-token grant over HTTPS
#[derive(Clone)]
pub struct OAuthAuthorizer {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for OAuthAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthAuthorizer")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl OAuthAuthorizer {
    /// Create an authorizer against Google's token endpoint
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AuthError::Rejected(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, client_id, client_secret))
    }

    /// Create an authorizer with a caller-supplied HTTP client
    pub fn with_client(
        client: Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Use a different token endpoint
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }
}

#[async_trait]
impl Authorizer for OAuthAuthorizer {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        debug!(token_url = %self.token_url, "Requesting credential refresh");
        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("Network error: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transient(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            let err = classify_token_error(status, &body);
            warn!(status = status.as_u16(), error = %err, "Credential refresh failed");
            return Err(err);
        }

        parse_token_response(&body)
    }
}

fn parse_token_response(body: &str) -> Result<Credential, AuthError> {
    let token: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::Transient(format!("Failed to parse token response: {e}")))?;

    let scopes = token
        .scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();

    Ok(Credential::new(
        token.access_token,
        Utc::now() + chrono::Duration::seconds(token.expires_in.max(0)),
        token.refresh_token.unwrap_or_default(),
        scopes,
    ))
}

fn classify_token_error(status: StatusCode, body: &str) -> AuthError {
    let detail = serde_json::from_str::<TokenErrorResponse>(body)
        .map(|e| match e.error_description {
            Some(desc) => format!("{}: {}", e.error, desc),
            None => e.error,
        })
        .unwrap_or_else(|_| format!("HTTP {status}"));

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuthError::Transient(detail)
    } else {
        AuthError::Rejected(detail)
    }
}
