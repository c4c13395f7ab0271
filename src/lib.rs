//! # Live Chat Engine
//!
//! A resilient client engine for consuming a rate-limited, paginated live chat
//! feed and exposing it as a typed, subscribable event stream.
//!
//! ## Features
//!
//! - **Polling State Machine**: Cursor-forwarding poll loop honouring the feed's interval hint
//! - **Backoff**: Exponential retry delay with injectable jitter source
//! - **Quota Accounting**: Daily unit budget with a fixed-timezone reset boundary
//! - **Token Refresh**: Background credential renewal ahead of expiry
//! - **Handler Registry**: Typed subscriptions with panic-isolated delivery
//! - **Moderation**: Send, delete, ban, timeout and moderator management
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use livechat_engine::auth::{oauth::OAuthAuthorizer, Credential};
//! use livechat_engine::bot::ChatBot;
//! use livechat_engine::transport::http::HttpTransport;
//! use livechat_engine::TextMessage;
//!
//! # async fn example(credential: Credential) -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new("live-chat-id")?);
//! let authorizer = Arc::new(OAuthAuthorizer::new("client-id", "client-secret")?);
//!
//! let bot = ChatBot::builder(transport, authorizer, credential).build()?;
//! bot.on(|msg: &TextMessage| {
//!     println!("{}: {}", msg.meta.author.display_name, msg.text);
//! });
//!
//! bot.connect()?;
//! bot.say("hello chat").await?;
//! bot.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Poll loop, backoff policy, quota tracker and lifecycle state
//! - [`registry`] - Handler registry keyed by event kind
//! - [`auth`] - Credentials, the refresh authorizer and the token coordinator
//! - [`transport`] - Feed transport abstraction, HTTP implementation and item parser
//! - [`bot`] - Facade composing everything into one connect/close lifecycle
//! - [`config`] - Configuration structs and defaults
//!
//! ## Data Types
//!
//! Every item read from the feed is decoded once into a variant of [`Event`].
//! Lifecycle and failure notifications travel the same path as chat messages,
//! so subscribers observe errors exclusively through [`EventKind::EngineError`]
//! and [`EventKind::ConnectionClosed`] handlers.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Credentials and token refresh
pub mod auth;

/// Chat bot facade
pub mod bot;

/// Configuration structs and defaults
pub mod config;

/// Poll loop, backoff and quota accounting
pub mod engine;

/// Crate-level error aggregate
pub mod error;

/// Tracing subscriber setup
pub mod logging;

/// Observability metrics
pub mod metrics;

/// Subscriber callback registry
pub mod registry;

/// Cancellation signalling shared by the background loops
pub mod shutdown;

/// Feed transport abstraction and HTTP implementation
pub mod transport;

// Re-export commonly used types
pub use bot::ChatBot;
pub use error::BotError;
pub use registry::{HandlerRegistry, SubscriptionToken};

/// Identity of the account that produced a chat item
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    /// Channel ID of the author
    pub channel_id: String,
    /// Display name shown in chat
    pub display_name: String,
    /// Channel URL, when the feed provides it
    pub channel_url: Option<String>,
    /// Avatar URL, when the feed provides it
    pub profile_image_url: Option<String>,
    /// Verified account badge
    pub is_verified: bool,
    /// Author owns the chat
    pub is_chat_owner: bool,
    /// Author is a channel member
    pub is_chat_sponsor: bool,
    /// Author moderates the chat
    pub is_chat_moderator: bool,
}

/// Fields common to every item decoded from the feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    /// Feed-assigned message ID
    pub id: String,
    /// Author of the item
    pub author: Author,
    /// When the feed says the item was published
    pub published_at: DateTime<Utc>,
    /// When this engine received the page containing the item
    pub received_at: DateTime<Utc>,
}

impl MessageMeta {
    /// Validate metadata integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("Message ID cannot be empty".to_string());
        }
        if self.author.channel_id.is_empty() {
            return Err(format!("Message {} has no author channel ID", self.id));
        }
        Ok(())
    }
}

/// Monetary amount attached to a paid event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    /// Amount in millionths of the currency unit
    pub amount_micros: u64,
    /// ISO 4217 currency code
    pub currency: String,
    /// Localised display string (e.g. "$5.00")
    pub display: String,
}

impl Money {
    /// Amount as a decimal in whole currency units
    pub fn amount(&self) -> Decimal {
        Decimal::from(self.amount_micros) / Decimal::from(1_000_000u32)
    }

    /// Validate amount integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(format!("Invalid currency code: {:?}", self.currency));
        }
        Ok(())
    }
}

/// Plain chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextMessage {
    /// Common metadata
    pub meta: MessageMeta,
    /// Message text
    pub text: String,
}

/// Paid message highlighted in chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuperChatEvent {
    /// Common metadata
    pub meta: MessageMeta,
    /// Amount paid
    pub money: Money,
    /// Comment attached by the purchaser
    pub comment: Option<String>,
    /// Display tier
    pub tier: u32,
}

/// Paid sticker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuperStickerEvent {
    /// Common metadata
    pub meta: MessageMeta,
    /// Amount paid
    pub money: Money,
    /// Sticker identifier
    pub sticker_id: String,
    /// Sticker alt text
    pub alt_text: String,
    /// Display tier
    pub tier: u32,
}

/// New or upgraded channel membership
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipEvent {
    /// Common metadata
    pub meta: MessageMeta,
    /// Membership level name
    pub level_name: String,
    /// Whether an existing member upgraded
    pub is_upgrade: bool,
}

/// Membership anniversary message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipMilestoneEvent {
    /// Common metadata
    pub meta: MessageMeta,
    /// Membership level name
    pub level_name: String,
    /// Total months of membership
    pub months: u32,
    /// Comment attached by the member
    pub comment: Option<String>,
}

/// Memberships gifted to other viewers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GiftMembershipEvent {
    /// Common metadata (author is the gifter)
    pub meta: MessageMeta,
    /// Number of memberships gifted
    pub count: u32,
    /// Membership level name
    pub level_name: String,
}

/// A viewer received a gifted membership
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GiftMembershipReceivedEvent {
    /// Common metadata (author is the recipient)
    pub meta: MessageMeta,
    /// Membership level name
    pub level_name: String,
    /// Channel ID of the gifter
    pub gifter_channel_id: String,
    /// ID of the gifting message this receipt belongs to
    pub gifting_message_id: String,
}

/// A message was removed by a moderator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDeleted {
    /// Common metadata (author is the moderator)
    pub meta: MessageMeta,
    /// ID of the removed message
    pub deleted_message_id: String,
}

/// Account affected by a ban
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BannedUser {
    /// Channel ID of the banned account
    pub channel_id: String,
    /// Display name of the banned account
    pub display_name: String,
}

/// Ban duration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BanType {
    /// Banned until explicitly unbanned
    Permanent,
    /// Timed out for a fixed duration
    Temporary {
        /// Length of the timeout
        duration: Duration,
    },
}

/// A user was banned or timed out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserBanned {
    /// Common metadata (author is the moderator)
    pub meta: MessageMeta,
    /// The banned account
    pub banned: BannedUser,
    /// Ban duration
    pub ban: BanType,
}

/// The poll loop started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOpened {
    /// When the loop started
    pub at: DateTime<Utc>,
    /// Feed being polled
    pub feed_id: String,
}

/// Why the poll loop ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` or `close()` was called
    Requested,
    /// The feed reported that it has ended
    FeedEnded,
    /// A fatal error of the given kind terminated the loop
    Error(ErrorKind),
    /// The loop task terminated abnormally
    Aborted,
}

/// The poll loop ended. Published exactly once per started loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionClosed {
    /// When the loop ended
    pub at: DateTime<Utc>,
    /// Feed that was being polled
    pub feed_id: String,
    /// Why the loop ended
    pub reason: CloseReason,
}

/// Error taxonomy shared by transports, the poll loop and error events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network failure, timeout, 5xx or rate limiting; retried with backoff
    Transient,
    /// Daily quota exhausted upstream
    QuotaExceeded,
    /// Credential rejected or expired
    Unauthorized,
    /// Resource does not exist
    NotFound,
    /// Caller lacks permission for the operation
    Forbidden,
    /// Unrecoverable failure
    Fatal,
    /// A subscriber callback panicked
    HandlerPanic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Fatal => "fatal",
            ErrorKind::HandlerPanic => "handler_panic",
        };
        write!(f, "{s}")
    }
}

/// Component that raised an [`EngineErrorEvent`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSource {
    /// Fetching a feed page
    Fetch,
    /// Renewing the credential
    TokenRefresh,
    /// A subscriber callback
    Handler,
}

/// Failure notification delivered to error subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineErrorEvent {
    /// When the failure was observed
    pub at: DateTime<Utc>,
    /// Component that failed
    pub source: ErrorSource,
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
    /// Whether the failure terminated the loop that raised it
    pub fatal: bool,
}

impl EngineErrorEvent {
    /// Build an error event stamped with the current time
    pub fn new(source: ErrorSource, kind: ErrorKind, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            at: Utc::now(),
            source,
            kind,
            message: message.into(),
            fatal,
        }
    }
}

/// Everything a subscriber can observe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// Plain chat message
    TextMessage(TextMessage),
    /// Paid highlighted message
    SuperChat(SuperChatEvent),
    /// Paid sticker
    SuperSticker(SuperStickerEvent),
    /// New or upgraded membership
    Membership(MembershipEvent),
    /// Membership anniversary
    MembershipMilestone(MembershipMilestoneEvent),
    /// Memberships gifted
    GiftMembership(GiftMembershipEvent),
    /// Gifted membership received
    GiftMembershipReceived(GiftMembershipReceivedEvent),
    /// Message removed
    MessageDeleted(MessageDeleted),
    /// User banned or timed out
    UserBanned(UserBanned),
    /// Poll loop started
    ConnectionOpened(ConnectionOpened),
    /// Poll loop ended
    ConnectionClosed(ConnectionClosed),
    /// Failure notification
    EngineError(EngineErrorEvent),
}

impl Event {
    /// Kind tag used to route the event to subscribers
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TextMessage(_) => EventKind::TextMessage,
            Event::SuperChat(_) => EventKind::SuperChat,
            Event::SuperSticker(_) => EventKind::SuperSticker,
            Event::Membership(_) => EventKind::Membership,
            Event::MembershipMilestone(_) => EventKind::MembershipMilestone,
            Event::GiftMembership(_) => EventKind::GiftMembership,
            Event::GiftMembershipReceived(_) => EventKind::GiftMembershipReceived,
            Event::MessageDeleted(_) => EventKind::MessageDeleted,
            Event::UserBanned(_) => EventKind::UserBanned,
            Event::ConnectionOpened(_) => EventKind::ConnectionOpened,
            Event::ConnectionClosed(_) => EventKind::ConnectionClosed,
            Event::EngineError(_) => EventKind::EngineError,
        }
    }

    /// Metadata of feed items; `None` for lifecycle and error events
    pub fn meta(&self) -> Option<&MessageMeta> {
        match self {
            Event::TextMessage(e) => Some(&e.meta),
            Event::SuperChat(e) => Some(&e.meta),
            Event::SuperSticker(e) => Some(&e.meta),
            Event::Membership(e) => Some(&e.meta),
            Event::MembershipMilestone(e) => Some(&e.meta),
            Event::GiftMembership(e) => Some(&e.meta),
            Event::GiftMembershipReceived(e) => Some(&e.meta),
            Event::MessageDeleted(e) => Some(&e.meta),
            Event::UserBanned(e) => Some(&e.meta),
            Event::ConnectionOpened(_) | Event::ConnectionClosed(_) | Event::EngineError(_) => None,
        }
    }

    /// Author of feed items
    pub fn author(&self) -> Option<&Author> {
        self.meta().map(|m| &m.author)
    }
}

/// Routing key for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// [`Event::TextMessage`]
    TextMessage,
    /// [`Event::SuperChat`]
    SuperChat,
    /// [`Event::SuperSticker`]
    SuperSticker,
    /// [`Event::Membership`]
    Membership,
    /// [`Event::MembershipMilestone`]
    MembershipMilestone,
    /// [`Event::GiftMembership`]
    GiftMembership,
    /// [`Event::GiftMembershipReceived`]
    GiftMembershipReceived,
    /// [`Event::MessageDeleted`]
    MessageDeleted,
    /// [`Event::UserBanned`]
    UserBanned,
    /// [`Event::ConnectionOpened`]
    ConnectionOpened,
    /// [`Event::ConnectionClosed`]
    ConnectionClosed,
    /// [`Event::EngineError`]
    EngineError,
}

impl EventKind {
    /// Every kind, in declaration order
    pub const ALL: [EventKind; 12] = [
        EventKind::TextMessage,
        EventKind::SuperChat,
        EventKind::SuperSticker,
        EventKind::Membership,
        EventKind::MembershipMilestone,
        EventKind::GiftMembership,
        EventKind::GiftMembershipReceived,
        EventKind::MessageDeleted,
        EventKind::UserBanned,
        EventKind::ConnectionOpened,
        EventKind::ConnectionClosed,
        EventKind::EngineError,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::TextMessage => "text_message",
            EventKind::SuperChat => "super_chat",
            EventKind::SuperSticker => "super_sticker",
            EventKind::Membership => "membership",
            EventKind::MembershipMilestone => "membership_milestone",
            EventKind::GiftMembership => "gift_membership",
            EventKind::GiftMembershipReceived => "gift_membership_received",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::UserBanned => "user_banned",
            EventKind::ConnectionOpened => "connection_opened",
            EventKind::ConnectionClosed => "connection_closed",
            EventKind::EngineError => "engine_error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| format!("Invalid event kind: {s}"))
    }
}
