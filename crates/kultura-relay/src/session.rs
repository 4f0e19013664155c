//! Per-connection session lifecycle.
//!
//! `Connecting → Authenticated → Active → Closing → Closed`, with
//! `Connecting → Closed` when the handshake never succeeds. One task runs
//! the whole session: it reads inbound frames, drains the connection's
//! outbound queue and drives the heartbeat from a single `select!` loop,
//! so closing the session cancels all three at once.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use kultura_shared::constants::{
    CLOSE_HANDSHAKE_TIMEOUT, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_MALFORMED_HANDSHAKE,
    CLOSE_PROTOCOL_VIOLATION, CLOSE_UNAUTHORIZED,
};
use kultura_shared::error::ProtocolError;
use kultura_shared::protocol::{ClientFrame, Handshake, ServerFrame};
use kultura_shared::types::{ConnectionId, UserId};

use crate::bus::RelayEvent;
use crate::error::RelayError;
use crate::rate_limit::TokenBucket;
use crate::registry::Bound;
use crate::relay::Relay;
use crate::transport::{CloseInfo, Transport, TransportFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    MalformedHandshake,
    Unauthorized,
    HandshakeTimeout,
    ProtocolViolation,
    HeartbeatTimeout,
    Transport(String),
}

impl CloseReason {
    /// WebSocket close code sent to the client, if the relay initiated the close.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            CloseReason::MalformedHandshake => Some(CLOSE_MALFORMED_HANDSHAKE),
            CloseReason::Unauthorized => Some(CLOSE_UNAUTHORIZED),
            CloseReason::HandshakeTimeout => Some(CLOSE_HANDSHAKE_TIMEOUT),
            CloseReason::ProtocolViolation => Some(CLOSE_PROTOCOL_VIOLATION),
            CloseReason::HeartbeatTimeout => Some(CLOSE_HEARTBEAT_TIMEOUT),
            CloseReason::ClientDisconnect | CloseReason::Transport(_) => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnect => f.write_str("client disconnected"),
            CloseReason::MalformedHandshake => f.write_str("malformed handshake"),
            CloseReason::Unauthorized => f.write_str("unauthorized"),
            CloseReason::HandshakeTimeout => f.write_str("handshake timeout"),
            CloseReason::ProtocolViolation => f.write_str("protocol violation"),
            CloseReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

enum Inbound {
    Envelope(Result<ClientFrame, ProtocolError>),
    Liveness,
    Closed(CloseReason),
}

fn classify(inbound: Option<Result<TransportFrame, RelayError>>) -> Inbound {
    match inbound {
        None | Some(Ok(TransportFrame::Close(_))) => Inbound::Closed(CloseReason::ClientDisconnect),
        Some(Err(e)) => Inbound::Closed(CloseReason::Transport(e.to_string())),
        Some(Ok(TransportFrame::Text(text))) => Inbound::Envelope(ClientFrame::parse(&text)),
        Some(Ok(TransportFrame::Binary(data))) => {
            Inbound::Envelope(ClientFrame::parse_bytes(&data))
        }
        Some(Ok(TransportFrame::Ping(_) | TransportFrame::Pong(_))) => Inbound::Liveness,
    }
}

pub struct Session<T> {
    id: ConnectionId,
    transport: T,
    outbox: mpsc::Receiver<ServerFrame>,
    state: SessionState,
    user: Option<UserId>,
    last_seen: Instant,
    envelope_budget: TokenBucket,
    relay: Arc<Relay>,
}

impl<T: Transport> Session<T> {
    pub fn new(
        id: ConnectionId,
        transport: T,
        outbox: mpsc::Receiver<ServerFrame>,
        relay: Arc<Relay>,
    ) -> Self {
        let settings = relay.settings();
        let envelope_budget = TokenBucket::new(settings.envelope_rate, settings.envelope_burst);
        Self {
            id,
            transport,
            outbox,
            state: SessionState::Connecting,
            user: None,
            last_seen: Instant::now(),
            envelope_budget,
            relay,
        }
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> CloseReason {
        let reason = match self.handshake().await {
            Ok(()) => self.serve().await,
            Err(reason) => reason,
        };
        self.shutdown(&reason).await;
        reason
    }

    async fn handshake(&mut self) -> Result<(), CloseReason> {
        let deadline = time::sleep(self.relay.settings().handshake_timeout);
        tokio::pin!(deadline);

        loop {
            let inbound = tokio::select! {
                _ = &mut deadline => {
                    warn!(conn = %self.id, "Handshake timed out");
                    return Err(CloseReason::HandshakeTimeout);
                }
                inbound = self.transport.recv() => inbound,
            };

            let parsed = match classify(inbound) {
                Inbound::Envelope(parsed) => parsed,
                Inbound::Liveness => continue,
                Inbound::Closed(reason) => return Err(reason),
            };

            match parsed {
                Ok(ClientFrame::Auth(handshake)) => return self.authenticate(handshake).await,
                Ok(ClientFrame::Ping) => self.write(ServerFrame::Pong).await?,
                Ok(other) => {
                    let err = RelayError::UnboundSender(self.id);
                    warn!(conn = %self.id, kind = other.kind(), "Envelope before handshake");
                    self.publish_rejection(&err);
                    return Err(CloseReason::ProtocolViolation);
                }
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "Malformed handshake");
                    self.write(ServerFrame::AuthError {
                        message: format!("malformed handshake: {e}"),
                    })
                    .await?;
                    return Err(CloseReason::MalformedHandshake);
                }
            }
        }
    }

    async fn authenticate(&mut self, handshake: Handshake) -> Result<(), CloseReason> {
        let user = handshake.user_id;
        let accepted = self
            .relay
            .verifier()
            .verify(user, &handshake.token)
            .await;
        if !accepted {
            warn!(conn = %self.id, user = %user, "Handshake rejected");
            self.publish_rejection(&RelayError::Unauthorized(user));
            self.write(ServerFrame::AuthError {
                message: "invalid credentials".into(),
            })
            .await?;
            return Err(CloseReason::Unauthorized);
        }

        let relay = Arc::clone(&self.relay);
        {
            let _order = relay.presence().lock_user(user).await;
            let bound = relay
                .registry()
                .bind(self.id, user)
                .await
                .map_err(|e| CloseReason::Transport(e.to_string()))?;
            self.user = Some(user);
            self.transition(SessionState::Authenticated);

            if bound == Bound::FirstConnection {
                relay.presence().announce(user, true).await;
            }
        }
        self.transition(SessionState::Active);
        self.write(ServerFrame::AuthSuccess { user_id: user }).await
    }

    async fn serve(&mut self) -> CloseReason {
        let period = self.relay.settings().heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.last_seen = Instant::now();

        loop {
            let idle_deadline = self.last_seen + period * 2;
            tokio::select! {
                inbound = self.transport.recv() => {
                    self.last_seen = Instant::now();
                    let outcome = match classify(inbound) {
                        Inbound::Envelope(parsed) => self.on_envelope(parsed).await,
                        Inbound::Liveness => Ok(()),
                        Inbound::Closed(reason) => Err(reason),
                    };
                    if let Err(reason) = outcome {
                        return reason;
                    }
                }
                Some(frame) = self.outbox.recv() => {
                    if let Err(reason) = self.write(frame).await {
                        return reason;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.transport.send(TransportFrame::Ping(Vec::new())).await {
                        return CloseReason::Transport(e.to_string());
                    }
                }
                _ = time::sleep_until(idle_deadline) => {
                    warn!(conn = %self.id, "No liveness signal, closing");
                    return CloseReason::HeartbeatTimeout;
                }
            }
        }
    }

    async fn on_envelope(
        &mut self,
        parsed: Result<ClientFrame, ProtocolError>,
    ) -> Result<(), CloseReason> {
        // Every inbound envelope costs a token, whatever its type.
        if !self.envelope_budget.try_consume() {
            return self.reject(RelayError::RateLimited).await;
        }
        let frame = match parsed {
            Ok(frame) => frame,
            Err(e) => return self.reject(RelayError::MalformedEnvelope(e.to_string())).await,
        };

        match frame {
            ClientFrame::Ping => self.write(ServerFrame::Pong).await,
            ClientFrame::Auth(handshake) => self.reauthenticate(handshake).await,
            frame => match self.relay.router().route(frame, self.id).await {
                Ok(_) => Ok(()),
                Err(e) => self.reject(e).await,
            },
        }
    }

    async fn reauthenticate(&mut self, handshake: Handshake) -> Result<(), CloseReason> {
        match self.user {
            Some(bound) if bound == handshake.user_id => {
                self.write(ServerFrame::AuthSuccess { user_id: bound }).await
            }
            Some(bound) => {
                self.reject(RelayError::AlreadyBound {
                    connection: self.id,
                    bound,
                    requested: handshake.user_id,
                })
                .await
            }
            None => Err(CloseReason::ProtocolViolation),
        }
    }

    /// Refuse one envelope. Fatal errors end the session; anything else is
    /// reported to the client and the session carries on.
    async fn reject(&mut self, err: RelayError) -> Result<(), CloseReason> {
        self.publish_rejection(&err);
        if err.is_fatal() {
            warn!(conn = %self.id, error = %err, "Fatal envelope error");
            return Err(CloseReason::ProtocolViolation);
        }
        debug!(conn = %self.id, code = err.code(), error = %err, "Envelope rejected");
        self.write(ServerFrame::error(err.code(), err.to_string()))
            .await
    }

    async fn write(&mut self, frame: ServerFrame) -> Result<(), CloseReason> {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "Failed to encode frame");
                return Ok(());
            }
        };
        self.transport
            .send(TransportFrame::Text(text))
            .await
            .map_err(|e| CloseReason::Transport(e.to_string()))
    }

    async fn shutdown(&mut self, reason: &CloseReason) {
        if self.state == SessionState::Connecting {
            self.relay.registry().close(self.id).await;
        } else {
            self.transition(SessionState::Closing);
            let relay = Arc::clone(&self.relay);
            let _order = match self.user {
                Some(user) => Some(relay.presence().lock_user(user).await),
                None => None,
            };
            if let Some(unbound) = relay.registry().close(self.id).await {
                if unbound.last_connection {
                    relay.presence().announce(unbound.user, false).await;
                }
            }
        }

        if let Some(code) = reason.close_code() {
            let close = TransportFrame::Close(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            }));
            if let Err(e) = self.transport.send(close).await {
                debug!(conn = %self.id, error = %e, "Close frame not sent");
            }
        }

        self.transition(SessionState::Closed);
        match self.user {
            Some(user) => info!(conn = %self.id, user = %user, %reason, "Session closed"),
            None => debug!(conn = %self.id, %reason, "Unauthenticated session closed"),
        }
        self.relay.bus().publish(RelayEvent::SessionClosed {
            connection: self.id,
            user: self.user,
            reason: reason.clone(),
        });
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {next:?}",
            self.state
        );
        debug!(conn = %self.id, from = ?self.state, to = ?next, "Session state changed");
        self.relay.bus().publish(RelayEvent::SessionTransition {
            connection: self.id,
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    fn publish_rejection(&self, err: &RelayError) {
        self.relay.bus().publish(RelayEvent::Rejected {
            connection: self.id,
            code: err.code(),
        });
    }
}
