//! Chat bot facade
//!
//! [`ChatBot`] wires one [`PollEngine`], one [`TokenCoordinator`], one
//! [`QuotaTracker`] and one [`HandlerRegistry`] into a single connect/close
//! lifecycle, and adds quota-accounted moderation calls that share the
//! engine's credential. Every instance owns its collaborators; share a
//! [`QuotaTracker`] across bots explicitly with
//! [`ChatBotBuilder::quota_tracker`].

use crate::auth::{Authorizer, Credential, TokenCoordinator};
use crate::config::BotConfig;
use crate::engine::{EngineState, PollEngine, QuotaListenerId, QuotaSnapshot, QuotaTracker, StopOutcome};
use crate::error::BotError;
use crate::metrics;
use crate::registry::{EventPayload, HandlerRegistry, SubscriptionToken};
use crate::transport::{Mutation, MutationOutcome, Transport};
use crate::{Event, EventKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest message the chat accepts, in characters
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Longest timeout the chat accepts (one day)
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Builder for [`ChatBot`]
pub struct ChatBotBuilder {
    transport: Arc<dyn Transport>,
    authorizer: Arc<dyn Authorizer>,
    credential: Credential,
    config: BotConfig,
    quota: Option<Arc<QuotaTracker>>,
}

impl ChatBotBuilder {
    /// Replace the default configuration
    pub fn config(mut self, config: BotConfig) -> Self {
        self.config = config;
        self
    }

    /// Charge quota against an existing tracker instead of a private one
    pub fn quota_tracker(mut self, quota: Arc<QuotaTracker>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Validate the configuration and assemble the bot
    pub fn build(self) -> Result<ChatBot, BotError> {
        self.config.validate()?;
        metrics::describe_metrics();

        let registry = HandlerRegistry::shared();
        let quota = self
            .quota
            .unwrap_or_else(|| Arc::new(QuotaTracker::new(&self.config.quota)));

        let mut tokens = TokenCoordinator::new(
            self.authorizer,
            self.credential,
            self.config.token.clone(),
            registry.clone(),
        );
        if let Some(seed) = self.config.poll.jitter_seed {
            tokens = tokens.with_jitter_seed(seed);
        }
        let tokens = Arc::new(tokens);

        let engine = PollEngine::new(
            self.transport.clone(),
            tokens.clone(),
            quota.clone(),
            registry.clone(),
            self.config.poll.clone(),
        );

        Ok(ChatBot {
            transport: self.transport,
            tokens,
            quota,
            registry,
            engine,
        })
    }
}

/// Live chat bot: event subscriptions plus moderation calls
pub struct ChatBot {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenCoordinator>,
    quota: Arc<QuotaTracker>,
    registry: Arc<HandlerRegistry>,
    engine: PollEngine,
}

impl std::fmt::Debug for ChatBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatBot")
            .field("engine", &self.engine)
            .field("tokens", &self.tokens)
            .field("quota", &self.quota)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ChatBot {
    /// Start building a bot for `transport`'s feed
    pub fn builder(
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn Authorizer>,
        credential: Credential,
    ) -> ChatBotBuilder {
        ChatBotBuilder {
            transport,
            authorizer,
            credential,
            config: BotConfig::default(),
            quota: None,
        }
    }

    /// Start token refresh (if not already active), then polling
    pub fn connect(&self) -> Result<(), BotError> {
        self.tokens.start()?;
        self.engine.start()?;
        info!(feed_id = %self.engine.feed_id(), "Chat bot connected");
        Ok(())
    }

    /// Stop polling, stop token refresh and drop every subscription
    pub async fn close(&self) {
        let outcome = self.engine.stop().await;
        self.tokens.stop().await;
        self.registry.clear();
        if outcome == StopOutcome::Stopped {
            info!(feed_id = %self.engine.feed_id(), "Chat bot closed");
        }
    }

    /// Clear the poll cursor and backoff state; only valid while stopped
    pub fn reset(&self) -> Result<(), BotError> {
        self.engine.reset().map_err(BotError::from)
    }

    /// Poll engine lifecycle state
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Underlying poll engine
    pub fn engine(&self) -> &PollEngine {
        &self.engine
    }

    /// Token coordinator shared by polling and moderation calls
    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        &self.tokens
    }

    /// Handler registry events are published through
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Subscribe to one event kind
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, callback)
    }

    /// Subscribe to one payload type
    pub fn on<T, F>(&self, callback: F) -> SubscriptionToken
    where
        T: EventPayload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.registry.on(callback)
    }

    /// Remove a subscription; repeated calls are no-ops
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.registry.unsubscribe(token)
    }

    /// Quota usage snapshot
    pub fn remaining_quota(&self) -> QuotaSnapshot {
        self.quota.remaining()
    }

    /// Observe every quota charge
    pub fn on_quota_update<F>(&self, callback: F) -> QuotaListenerId
    where
        F: Fn(QuotaSnapshot) + Send + Sync + 'static,
    {
        self.quota.on_update(callback)
    }

    /// Post a text message
    pub async fn say(&self, text: impl Into<String>) -> Result<MutationOutcome, BotError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(BotError::InvalidArgument("message text is empty".to_string()));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(BotError::InvalidArgument(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
        self.mutate(Mutation::SendMessage { text }).await
    }

    /// Delete a message by ID
    pub async fn delete_message(&self, message_id: impl Into<String>) -> Result<MutationOutcome, BotError> {
        let message_id = required("message_id", message_id.into())?;
        self.mutate(Mutation::DeleteMessage { message_id }).await
    }

    /// Ban a channel permanently
    pub async fn ban(&self, channel_id: impl Into<String>) -> Result<MutationOutcome, BotError> {
        let channel_id = required("channel_id", channel_id.into())?;
        self.mutate(Mutation::Ban { channel_id }).await
    }

    /// Ban a channel for `duration`
    pub async fn timeout(
        &self,
        channel_id: impl Into<String>,
        duration: Duration,
    ) -> Result<MutationOutcome, BotError> {
        let channel_id = required("channel_id", channel_id.into())?;
        if duration.is_zero() || duration > MAX_TIMEOUT {
            return Err(BotError::InvalidArgument(format!(
                "timeout must be between 1s and {}s, got {}s",
                MAX_TIMEOUT.as_secs(),
                duration.as_secs()
            )));
        }
        self.mutate(Mutation::Timeout {
            channel_id,
            duration,
        })
        .await
    }

    /// Lift a ban by the ID returned from [`ChatBot::ban`] or [`ChatBot::timeout`]
    pub async fn unban(&self, ban_id: impl Into<String>) -> Result<MutationOutcome, BotError> {
        let ban_id = required("ban_id", ban_id.into())?;
        self.mutate(Mutation::Unban { ban_id }).await
    }

    /// Grant moderator rights to a channel
    pub async fn add_moderator(&self, channel_id: impl Into<String>) -> Result<MutationOutcome, BotError> {
        let channel_id = required("channel_id", channel_id.into())?;
        self.mutate(Mutation::AddModerator { channel_id }).await
    }

    /// Revoke moderator rights by the ID returned from [`ChatBot::add_moderator`]
    pub async fn remove_moderator(
        &self,
        moderator_id: impl Into<String>,
    ) -> Result<MutationOutcome, BotError> {
        let moderator_id = required("moderator_id", moderator_id.into())?;
        self.mutate(Mutation::RemoveModerator { moderator_id }).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome, BotError> {
        let snapshot = self.quota.add(mutation.cost());
        let credential = self.tokens.credential();
        debug!(
            operation = mutation.name(),
            quota_used = snapshot.used,
            "Issuing chat mutation"
        );

        self.transport
            .mutate(&mutation, &credential)
            .await
            .map_err(|e| {
                warn!(operation = mutation.name(), error = %e, "Chat mutation failed");
                BotError::from(e)
            })
    }
}

fn required(field: &str, value: String) -> Result<String, BotError> {
    if value.trim().is_empty() {
        return Err(BotError::InvalidArgument(format!("{field} cannot be empty")));
    }
    Ok(value)
}
