//! Relay counters, fed from the event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::bus::{EventBus, EventKind, RelayEvent};

#[derive(Debug, Default)]
pub struct RelayStats {
    connections_opened: AtomicU64,
    sessions_closed: AtomicU64,
    envelopes_routed: AtomicU64,
    envelopes_undelivered: AtomicU64,
    presence_broadcasts: AtomicU64,
    envelopes_rejected: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`], as served on `/info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub sessions_closed: u64,
    pub envelopes_routed: u64,
    pub envelopes_undelivered: u64,
    pub presence_broadcasts: u64,
    pub envelopes_rejected: u64,
}

impl RelayStats {
    /// Create counters subscribed to every event kind on `bus`.
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let stats = Arc::new(Self::default());
        for kind in [
            EventKind::Connection,
            EventKind::Session,
            EventKind::Delivery,
            EventKind::Presence,
            EventKind::Rejection,
        ] {
            let stats = Arc::clone(&stats);
            bus.subscribe(kind, move |event| stats.record(event));
        }
        stats
    }

    fn record(&self, event: &RelayEvent) {
        let counter = match event {
            RelayEvent::ConnectionOpened { .. } => &self.connections_opened,
            RelayEvent::SessionClosed { .. } => &self.sessions_closed,
            RelayEvent::Delivered { connections, .. } => {
                if *connections == 0 {
                    self.envelopes_undelivered.fetch_add(1, Ordering::Relaxed);
                }
                &self.envelopes_routed
            }
            RelayEvent::PresenceChanged { .. } => &self.presence_broadcasts,
            RelayEvent::Rejected { .. } => &self.envelopes_rejected,
            RelayEvent::SessionTransition { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            envelopes_routed: self.envelopes_routed.load(Ordering::Relaxed),
            envelopes_undelivered: self.envelopes_undelivered.load(Ordering::Relaxed),
            presence_broadcasts: self.presence_broadcasts.load(Ordering::Relaxed),
            envelopes_rejected: self.envelopes_rejected.load(Ordering::Relaxed),
        }
    }
}
