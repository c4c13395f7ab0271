//! HTTP transport for the YouTube Data API v3 live chat endpoints
//!
//! One request per call; retries belong to the poll loop, which sees every
//! failure already classified (see [`super::classify`]).

use super::classify::{classify_request_error, classify_status};
use super::endpoints::{self, BASE_URL, MAX_RESULTS, MESSAGES_PATH, MESSAGE_PARTS};
use super::{FeedPage, Mutation, MutationOutcome, Transport, TransportError, TransportResult};
use crate::auth::Credential;
use crate::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    polling_interval_millis: Option<u64>,
    #[serde(default)]
    offline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    items: Vec<Value>,
}

/// [`Transport`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    live_chat_id: String,
}

impl HttpTransport {
    /// Create a transport for `live_chat_id` with the default request timeout
    pub fn new(live_chat_id: impl Into<String>) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Fatal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, live_chat_id))
    }

    /// Create a transport with a caller-supplied client
    pub fn with_client(client: Client, live_chat_id: impl Into<String>) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            live_chat_id: live_chat_id.into(),
        }
    }

    /// Point the transport at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, path: &str, credential: &Credential) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .bearer_auth(&credential.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> TransportResult<String> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_request_error(&e))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        Ok(body)
    }

    fn build_mutation(&self, mutation: &Mutation, credential: &Credential) -> RequestBuilder {
        let path = endpoints::mutation_path(mutation);
        let chat = self.live_chat_id.as_str();

        match mutation {
            Mutation::SendMessage { text } => self
                .request(Method::POST, path, credential)
                .query(&[("part", "snippet")])
                .json(&json!({
                    "snippet": {
                        "liveChatId": chat,
                        "type": "textMessageEvent",
                        "textMessageDetails": { "messageText": text }
                    }
                })),
            Mutation::Ban { channel_id } => self
                .request(Method::POST, path, credential)
                .query(&[("part", "snippet")])
                .json(&json!({
                    "snippet": {
                        "liveChatId": chat,
                        "type": "permanent",
                        "bannedUserDetails": { "channelId": channel_id }
                    }
                })),
            Mutation::Timeout {
                channel_id,
                duration,
            } => self
                .request(Method::POST, path, credential)
                .query(&[("part", "snippet")])
                .json(&json!({
                    "snippet": {
                        "liveChatId": chat,
                        "type": "temporary",
                        "banDurationSeconds": duration.as_secs().max(1),
                        "bannedUserDetails": { "channelId": channel_id }
                    }
                })),
            Mutation::AddModerator { channel_id } => self
                .request(Method::POST, path, credential)
                .query(&[("part", "snippet")])
                .json(&json!({
                    "snippet": {
                        "liveChatId": chat,
                        "moderatorDetails": { "channelId": channel_id }
                    }
                })),
            Mutation::DeleteMessage { message_id: id }
            | Mutation::Unban { ban_id: id }
            | Mutation::RemoveModerator { moderator_id: id } => self
                .request(Method::DELETE, path, credential)
                .query(&[("id", id.as_str())]),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn feed_id(&self) -> &str {
        &self.live_chat_id
    }

    async fn fetch_page(&self, page_token: Option<&str>, credential: &Credential) -> TransportResult<FeedPage> {
        let max_results = MAX_RESULTS.to_string();
        let mut params = vec![
            ("liveChatId", self.live_chat_id.as_str()),
            ("part", MESSAGE_PARTS),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        debug!(live_chat_id = %self.live_chat_id, page_token = ?page_token, "Fetching chat page");
        let request = self
            .request(Method::GET, MESSAGES_PATH, credential)
            .query(&params);
        let body = self.send(request).await?;

        let list: ListResponse = serde_json::from_str(&body)
            .map_err(|e| TransportError::Transient(format!("Failed to parse chat page: {e}")))?;

        Ok(FeedPage {
            items: list.items,
            next_page_token: list.next_page_token,
            interval_hint: Duration::from_millis(list.polling_interval_millis.unwrap_or(0)),
            offline_at: list.offline_at,
        })
    }

    async fn mutate(&self, mutation: &Mutation, credential: &Credential) -> TransportResult<MutationOutcome> {
        debug!(operation = mutation.name(), "Sending chat mutation");
        let body = self.send(self.build_mutation(mutation, credential)).await?;

        if body.trim().is_empty() {
            return Ok(MutationOutcome::default());
        }
        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::Fatal(format!("Failed to parse mutation response: {e}")))?;
        Ok(MutationOutcome {
            id: raw.get("id").and_then(Value::as_str).map(str::to_string),
            raw,
        })
    }
}
