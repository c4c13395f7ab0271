//! Feed transport abstraction
//!
//! The poll engine and the bot facade talk to the feed exclusively through the
//! [`Transport`] trait. Implementations classify every failure into the
//! [`TransportError`] taxonomy; the engine decides retry and termination from
//! that classification alone.

use crate::auth::Credential;
use crate::ErrorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

pub mod classify;
pub mod endpoints;
pub mod http;
pub mod parser;

pub use http::HttpTransport;
pub use parser::{ItemParser, ParsedItem};

/// Transport errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// Network failure, timeout, 5xx or rate limiting
    #[error("transient error: {0}")]
    Transient(String),

    /// Daily quota exhausted upstream
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Credential rejected or expired
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks permission
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unrecoverable failure, including the feed having ended
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Taxonomy tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Transient(_) => ErrorKind::Transient,
            TransportError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            TransportError::Unauthorized(_) => ErrorKind::Unauthorized,
            TransportError::NotFound(_) => ErrorKind::NotFound,
            TransportError::Forbidden(_) => ErrorKind::Forbidden,
            TransportError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Check if the error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Detail message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            TransportError::Transient(m)
            | TransportError::QuotaExceeded(m)
            | TransportError::Unauthorized(m)
            | TransportError::NotFound(m)
            | TransportError::Forbidden(m)
            | TransportError::Fatal(m) => m,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One page of raw feed items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    /// Raw items in feed order
    pub items: Vec<Value>,
    /// Continuation token for the next fetch
    pub next_page_token: Option<String>,
    /// Server-suggested wait before the next fetch
    pub interval_hint: Duration,
    /// Set when the feed has gone offline
    pub offline_at: Option<DateTime<Utc>>,
}

/// A quota-bearing write against the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Post a text message
    SendMessage {
        /// Message text
        text: String,
    },
    /// Delete a message
    DeleteMessage {
        /// ID of the message to delete
        message_id: String,
    },
    /// Ban a channel permanently
    Ban {
        /// Channel to ban
        channel_id: String,
    },
    /// Ban a channel for a fixed duration
    Timeout {
        /// Channel to time out
        channel_id: String,
        /// Length of the timeout
        duration: Duration,
    },
    /// Lift a ban
    Unban {
        /// ID returned when the ban was created
        ban_id: String,
    },
    /// Grant moderator rights
    AddModerator {
        /// Channel to promote
        channel_id: String,
    },
    /// Revoke moderator rights
    RemoveModerator {
        /// ID returned when the moderator was added
        moderator_id: String,
    },
}

impl Mutation {
    /// Quota units charged for this operation
    pub fn cost(&self) -> u64 {
        endpoints::mutation_cost(self)
    }

    /// Short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::SendMessage { .. } => "send_message",
            Mutation::DeleteMessage { .. } => "delete_message",
            Mutation::Ban { .. } => "ban",
            Mutation::Timeout { .. } => "timeout",
            Mutation::Unban { .. } => "unban",
            Mutation::AddModerator { .. } => "add_moderator",
            Mutation::RemoveModerator { .. } => "remove_moderator",
        }
    }
}

/// Result of a successful mutation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// ID of the created resource, for inserts
    pub id: Option<String>,
    /// Raw response body; `Value::Null` for deletes
    pub raw: Value,
}

/// Access to one live chat feed
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier of the feed this transport reads
    fn feed_id(&self) -> &str;

    /// Fetch the page following `page_token` (`None` for the first page)
    async fn fetch_page(&self, page_token: Option<&str>, credential: &Credential) -> TransportResult<FeedPage>;

    /// Perform a write operation
    async fn mutate(&self, mutation: &Mutation, credential: &Credential) -> TransportResult<MutationOutcome>;
}
