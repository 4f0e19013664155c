//! Connection registry.
//!
//! Owns every live connection for its whole lifetime: its outbound queue
//! and, once the handshake succeeds, the user it is bound to. A user may
//! hold several connections at once (one per device). Presence is derived
//! from here: a user is online iff at least one connection is bound to them.
//!
//! Both indexes live behind one lock and every critical section is
//! synchronous, so readers never see a connection that is half bound or
//! half removed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use kultura_shared::protocol::ServerFrame;
use kultura_shared::types::{ConnectionId, UserId};

use crate::error::RelayError;

struct ConnectionEntry {
    user: Option<UserId>,
    outbox: mpsc::Sender<ServerFrame>,
    opened_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn detach(&mut self, connection: &ConnectionId, user: UserId) -> Unbound {
        let mut last_connection = false;
        if let Some(set) = self.users.get_mut(&user) {
            set.remove(connection);
            if set.is_empty() {
                self.users.remove(&user);
                last_connection = true;
            }
        }
        Unbound {
            user,
            last_connection,
        }
    }
}

/// Result of a successful [`ConnectionRegistry::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// The user had no other connection: they just came online.
    FirstConnection,
    /// The user was already online on another connection.
    AdditionalConnection,
    /// The connection was already bound to this same user.
    Unchanged,
}

/// Result of removing a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unbound {
    pub user: UserId,
    /// The user has no connection left: they just went offline.
    pub last_connection: bool,
}

/// Snapshot of one connection for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection: ConnectionId,
    pub user: Option<UserId>,
    pub opened_at: DateTime<Utc>,
}

pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            queue_capacity,
        }
    }

    /// Register a new, unauthenticated connection and hand back its id and
    /// the receiving end of its outbound queue.
    pub async fn open(&self) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let entry = ConnectionEntry {
            user: None,
            outbox: tx,
            opened_at: Utc::now(),
        };
        self.state.write().await.connections.insert(id, entry);
        (id, rx)
    }

    /// Associate a connection with a user.
    ///
    /// Rebinding a connection to the same user is a no-op; rebinding it to a
    /// different user without [`unbind`](Self::unbind) first is refused.
    pub async fn bind(&self, connection: ConnectionId, user: UserId) -> Result<Bound, RelayError> {
        let mut state = self.state.write().await;

        let entry = state
            .connections
            .get_mut(&connection)
            .ok_or(RelayError::UnknownConnection(connection))?;

        match entry.user {
            Some(bound) if bound == user => return Ok(Bound::Unchanged),
            Some(bound) => {
                return Err(RelayError::AlreadyBound {
                    connection,
                    bound,
                    requested: user,
                })
            }
            None => entry.user = Some(user),
        }

        let set = state.users.entry(user).or_default();
        set.insert(connection);
        let outcome = if set.len() == 1 {
            Bound::FirstConnection
        } else {
            Bound::AdditionalConnection
        };

        debug!(conn = %connection, user = %user, ?outcome, "Connection bound");
        Ok(outcome)
    }

    /// Drop a connection's user binding, keeping the connection registered.
    /// Returns `None` if it was not bound.
    pub async fn unbind(&self, connection: ConnectionId) -> Option<Unbound> {
        let mut state = self.state.write().await;
        let user = state.connections.get_mut(&connection)?.user.take()?;
        Some(state.detach(&connection, user))
    }

    /// Remove a connection entirely, unbinding it first if needed.
    /// Idempotent.
    pub async fn close(&self, connection: ConnectionId) -> Option<Unbound> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(&connection)?;
        let user = entry.user?;
        Some(state.detach(&connection, user))
    }

    pub async fn user_for(&self, connection: ConnectionId) -> Option<UserId> {
        self.state
            .read()
            .await
            .connections
            .get(&connection)
            .and_then(|entry| entry.user)
    }

    pub async fn connections_for(&self, user: UserId) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .users
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.state.read().await.users.contains_key(&user)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.state.read().await.users.keys().copied().collect();
        users.sort();
        users
    }

    /// `(open connections, online users)`
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.connections.len(), state.users.len())
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.state
            .read()
            .await
            .connections
            .iter()
            .map(|(id, entry)| ConnectionSnapshot {
                connection: *id,
                user: entry.user,
                opened_at: entry.opened_at,
            })
            .collect()
    }

    /// Queue a frame on one connection. Returns `false` if the connection is
    /// gone or its queue is full; the frame is dropped either way.
    pub async fn send_to_connection(&self, connection: ConnectionId, frame: ServerFrame) -> bool {
        let outbox = {
            let state = self.state.read().await;
            match state.connections.get(&connection) {
                Some(entry) => entry.outbox.clone(),
                None => {
                    debug!(conn = %connection, "Send to unknown connection dropped");
                    return false;
                }
            }
        };
        enqueue(connection, &outbox, frame)
    }

    /// Queue a frame on every connection bound to `user`.
    /// Returns how many connections accepted it; zero when the user is offline.
    pub async fn send_to_user(&self, user: UserId, frame: &ServerFrame) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerFrame>)> = {
            let state = self.state.read().await;
            let Some(set) = state.users.get(&user) else {
                return 0;
            };
            set.iter()
                .filter_map(|id| {
                    state
                        .connections
                        .get(id)
                        .map(|entry| (*id, entry.outbox.clone()))
                })
                .collect()
        };

        targets
            .into_iter()
            .filter(|(id, outbox)| enqueue(*id, outbox, frame.clone()))
            .count()
    }
}

fn enqueue(connection: ConnectionId, outbox: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> bool {
    match outbox.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn = %connection, "Send queue full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn = %connection, "Target connection closed, dropping frame");
            false
        }
    }
}
