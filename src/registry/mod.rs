//! Subscriber callback registry
//!
//! Callbacks are keyed by [`EventKind`] and identified by an opaque
//! [`SubscriptionToken`]. Publishing snapshots the matching callbacks and
//! releases the table lock before invoking any of them, so handlers may
//! subscribe, unsubscribe or publish re-entrantly and a slow handler never
//! blocks registry mutation from other threads.
//!
//! Each invocation runs inside its own unwind boundary. A panicking callback is
//! converted into an [`Event::EngineError`] with kind
//! [`ErrorKind::HandlerPanic`] and delivered to error subscribers; delivery of
//! the original event continues with the next callback.

use crate::metrics;
use crate::{
    ConnectionClosed, ConnectionOpened, EngineErrorEvent, ErrorKind, ErrorSource, Event, EventKind,
    GiftMembershipEvent, GiftMembershipReceivedEvent, MembershipEvent, MembershipMilestoneEvent,
    MessageDeleted, SuperChatEvent, SuperStickerEvent, TextMessage, UserBanned,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Type-erased subscriber callback
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle returned by subscribe calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// Where a subscription is routed
#[derive(Debug, Clone, Copy)]
enum Route {
    Kind(EventKind),
    All,
}

#[derive(Default)]
struct Table {
    by_kind: HashMap<EventKind, Vec<(SubscriptionToken, Handler)>>,
    all: Vec<(SubscriptionToken, Handler)>,
    routes: HashMap<SubscriptionToken, Route>,
}

/// Registry of subscriber callbacks keyed by event kind
pub struct HandlerRegistry {
    table: RwLock<Table>,
    next_id: AtomicU64,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an empty registry wrapped in [`Arc`]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register `callback` for events of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = self.next_token();
        let mut table = self.table.write();
        table
            .by_kind
            .entry(kind)
            .or_default()
            .push((token, Arc::new(callback)));
        table.routes.insert(token, Route::Kind(kind));
        token
    }

    /// Register `callback` for every event kind
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = self.next_token();
        let mut table = self.table.write();
        table.all.push((token, Arc::new(callback)));
        table.routes.insert(token, Route::All);
        token
    }

    /// Register a callback for one payload type
    ///
    /// ```
    /// use livechat_engine::{HandlerRegistry, SuperChatEvent};
    ///
    /// let registry = HandlerRegistry::new();
    /// registry.on(|event: &SuperChatEvent| {
    ///     println!("{} sent {}", event.meta.author.display_name, event.money.display);
    /// });
    /// ```
    pub fn on<T, F>(&self, callback: F) -> SubscriptionToken
    where
        T: EventPayload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(T::KIND, move |event| {
            if let Some(payload) = T::from_event(event) {
                callback(payload);
            }
        })
    }

    /// Remove a subscription. Returns `false` when the token is unknown or
    /// was already removed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut table = self.table.write();
        let Some(route) = table.routes.remove(&token) else {
            return false;
        };

        match route {
            Route::Kind(kind) => {
                if let Some(entries) = table.by_kind.get_mut(&kind) {
                    entries.retain(|(t, _)| *t != token);
                    if entries.is_empty() {
                        table.by_kind.remove(&kind);
                    }
                }
            }
            Route::All => table.all.retain(|(t, _)| *t != token),
        }
        true
    }

    /// Remove every subscription
    pub fn clear(&self) {
        let mut table = self.table.write();
        table.by_kind.clear();
        table.all.clear();
        table.routes.clear();
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.table.read().routes.len()
    }

    /// Whether no subscriptions exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callbacks that would receive an event of `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let table = self.table.read();
        table.by_kind.get(&kind).map_or(0, Vec::len) + table.all.len()
    }

    /// Deliver `event` to every callback registered for its kind, then to
    /// every all-kinds callback. Returns the number of callbacks that
    /// completed without panicking.
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.kind();
        let handlers = self.snapshot(kind);
        metrics::record_event_published(&kind.to_string());

        let mut delivered = 0;
        for (token, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => self.handle_panic(kind, token, payload),
            }
        }
        delivered
    }

    fn snapshot(&self, kind: EventKind) -> Vec<(SubscriptionToken, Handler)> {
        let table = self.table.read();
        table
            .by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .chain(table.all.iter())
            .map(|(token, handler)| (*token, Arc::clone(handler)))
            .collect()
    }

    fn handle_panic(&self, kind: EventKind, token: SubscriptionToken, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        metrics::record_handler_panic(&kind.to_string());

        if kind == EventKind::EngineError {
            // An error handler failing again would recurse forever; log only.
            error!(
                subscription = token.0,
                panic = %message,
                "Error handler panicked"
            );
            return;
        }

        warn!(
            subscription = token.0,
            kind = %kind,
            panic = %message,
            "Event handler panicked"
        );
        let error = EngineErrorEvent::new(
            ErrorSource::Handler,
            ErrorKind::HandlerPanic,
            format!("handler for {kind} panicked: {message}"),
            false,
        );
        self.publish(&Event::EngineError(error));
    }

    fn next_token(&self) -> SubscriptionToken {
        SubscriptionToken(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A payload type carried by exactly one [`Event`] variant
pub trait EventPayload: Send + Sync + 'static {
    /// Kind of the carrying variant
    const KIND: EventKind;

    /// Borrow the payload if `event` is the carrying variant
    fn from_event(event: &Event) -> Option<&Self>;
}

macro_rules! impl_event_payload {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl EventPayload for $ty {
                const KIND: EventKind = EventKind::$variant;

                fn from_event(event: &Event) -> Option<&Self> {
                    match event {
                        Event::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_event_payload! {
    TextMessage => TextMessage,
    SuperChatEvent => SuperChat,
    SuperStickerEvent => SuperSticker,
    MembershipEvent => Membership,
    MembershipMilestoneEvent => MembershipMilestone,
    GiftMembershipEvent => GiftMembership,
    GiftMembershipReceivedEvent => GiftMembershipReceived,
    MessageDeleted => MessageDeleted,
    UserBanned => UserBanned,
    ConnectionOpened => ConnectionOpened,
    ConnectionClosed => ConnectionClosed,
    EngineErrorEvent => EngineError,
}
