//! Relay component wiring.
//!
//! [`Relay`] owns the connection registry and the stateless services built
//! on top of it (router, presence tracker), plus the event bus they report
//! to. Each accepted transport becomes one session task.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::audience::{AudienceResolver, ContactBook, EveryoneOnline};
use crate::auth::CredentialVerifier;
use crate::bus::{EventBus, RelayEvent};
use crate::config::{PresenceScope, RelayConfig};
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::session::{CloseReason, Session};
use crate::stats::RelayStats;
use crate::transport::Transport;

/// Timing and budget settings applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub envelope_rate: f64,
    pub envelope_burst: f64,
}

impl From<&RelayConfig> for SessionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            heartbeat_interval: config.heartbeat_interval,
            envelope_rate: config.envelope_rate,
            envelope_burst: config.envelope_burst,
        }
    }
}

pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    router: MessageRouter,
    presence: Arc<PresenceTracker>,
    verifier: Arc<dyn CredentialVerifier>,
    bus: Arc<EventBus>,
    stats: Arc<RelayStats>,
    settings: SessionSettings,
}

impl Relay {
    pub fn new(config: &RelayConfig, verifier: Arc<dyn CredentialVerifier>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.send_queue_capacity));
        let audience: Arc<dyn AudienceResolver> = match config.presence_scope {
            PresenceScope::Contacts => Arc::new(ContactBook::new()),
            PresenceScope::Everyone => Arc::new(EveryoneOnline::new(Arc::clone(&registry))),
        };

        let bus = Arc::new(EventBus::new());
        let stats = RelayStats::attach(&bus);
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            Arc::clone(&audience),
            Arc::clone(&bus),
        ));
        let router = MessageRouter::new(
            Arc::clone(&registry),
            audience,
            Arc::clone(&presence),
            Arc::clone(&bus),
        );

        Arc::new(Self {
            registry,
            router,
            presence,
            verifier,
            bus,
            stats,
            settings: SessionSettings::from(config),
        })
    }

    /// Serve one freshly established transport until it closes.
    pub async fn accept<T: Transport>(self: &Arc<Self>, transport: T) -> CloseReason {
        let (id, outbox) = self.registry.open().await;
        debug!(conn = %id, "Connection opened");
        self.bus.publish(RelayEvent::ConnectionOpened { connection: id });

        Session::new(id, transport, outbox, Arc::clone(self))
            .run()
            .await
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn verifier(&self) -> &dyn CredentialVerifier {
        self.verifier.as_ref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use kultura_shared::types::UserId;

    use super::*;
    use crate::auth::TrustingVerifier;
    use crate::transport::memory;

    #[tokio::test]
    async fn test_everyone_scope_announces_to_all_online() {
        let config = RelayConfig {
            presence_scope: PresenceScope::Everyone,
            ..RelayConfig::default()
        };
        let relay = Relay::new(&config, Arc::new(TrustingVerifier));

        let (c2, mut rx2) = relay.registry().open().await;
        relay.registry().bind(c2, UserId(2)).await.unwrap();

        assert_eq!(relay.presence().announce(UserId(1), true).await, 1);
        assert!(rx2.try_recv().is_ok());
        assert_eq!(relay.stats().snapshot().presence_broadcasts, 1);
    }

    #[tokio::test]
    async fn test_accept_counts_connection() {
        let relay = Relay::new(&RelayConfig::default(), Arc::new(TrustingVerifier));
        let (transport, mut peer) = memory::pair();
        peer.hang_up();

        let reason = relay.accept(transport).await;
        assert_eq!(reason, CloseReason::ClientDisconnect);

        let stats = relay.stats().snapshot();
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(relay.registry().counts().await, (0, 0));
    }
}
