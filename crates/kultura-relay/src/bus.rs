//! Typed in-process event bus.
//!
//! Components publish [`RelayEvent`]s without knowing who consumes them;
//! observers (counters, logging, tests) subscribe per [`EventKind`].
//! Handlers run synchronously on the publishing task and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use kultura_shared::types::{ConnectionId, UserId};

use crate::session::{CloseReason, SessionState};

/// Envelope kinds the router forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    ChatMessage,
    Typing,
    ReadReceipt,
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    ConnectionOpened {
        connection: ConnectionId,
    },
    SessionTransition {
        connection: ConnectionId,
        from: SessionState,
        to: SessionState,
    },
    SessionClosed {
        connection: ConnectionId,
        user: Option<UserId>,
        reason: CloseReason,
    },
    /// An envelope was routed; `connections` is how many receiver
    /// connections it was queued on (zero when the receiver is offline).
    Delivered {
        kind: DeliveryKind,
        from: UserId,
        to: UserId,
        connections: usize,
    },
    PresenceChanged {
        user: UserId,
        online: bool,
        notified: usize,
    },
    Rejected {
        connection: ConnectionId,
        code: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    Session,
    Delivery,
    Presence,
    Rejection,
}

impl RelayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RelayEvent::ConnectionOpened { .. } => EventKind::Connection,
            RelayEvent::SessionTransition { .. } | RelayEvent::SessionClosed { .. } => {
                EventKind::Session
            }
            RelayEvent::Delivered { .. } => EventKind::Delivery,
            RelayEvent::PresenceChanged { .. } => EventKind::Presence,
            RelayEvent::Rejected { .. } => EventKind::Rejection,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionToken, EventHandler)>>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    /// Remove a subscription. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for subscribers in handlers.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(t, _)| *t != token);
            removed |= subscribers.len() != before;
        }
        removed
    }

    pub fn publish(&self, event: RelayEvent) {
        // Snapshot first so handlers may (un)subscribe without deadlocking.
        let subscribers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in subscribers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}
