//! Presence announcements.
//!
//! Whether a user is online is read from the registry. The session layer
//! calls [`PresenceTracker::announce`] only on a user's 0→1 and 1→0
//! connection transitions, as reported atomically by the registry, and
//! holds [`PresenceTracker::lock_user`] across the registry change and the
//! announcement so a user's transitions reach watchers in order.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use kultura_shared::protocol::{PresenceUpdate, ServerFrame};
use kultura_shared::types::UserId;

use crate::audience::AudienceResolver;
use crate::bus::{EventBus, RelayEvent};
use crate::registry::ConnectionRegistry;

/// Number of per-user transition locks; users share a stripe by id.
const TRANSITION_STRIPES: usize = 64;

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    audience: Arc<dyn AudienceResolver>,
    bus: Arc<EventBus>,
    transitions: Vec<Mutex<()>>,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        audience: Arc<dyn AudienceResolver>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            audience,
            bus,
            transitions: (0..TRANSITION_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Serialize presence transitions for `user`.
    ///
    /// Hold the guard from the registry bind or close through the matching
    /// [`announce`](Self::announce). Never take a second user's lock while
    /// holding one.
    pub async fn lock_user(&self, user: UserId) -> MutexGuard<'_, ()> {
        let stripe = (user.0 % TRANSITION_STRIPES as u64) as usize;
        self.transitions[stripe].lock().await
    }

    /// Tell `user`'s audience that they came online or went offline.
    /// Returns the number of connections the update was queued on.
    pub async fn announce(&self, user: UserId, online: bool) -> usize {
        let frame = ServerFrame::PresenceUpdate(PresenceUpdate {
            user_id: user,
            is_online: online,
            last_seen: (!online).then(Utc::now),
        });

        let mut notified = 0;
        for target in self.audience.audience(user).await {
            if target != user {
                notified += self.registry.send_to_user(target, &frame).await;
            }
        }

        if !online {
            self.audience.forget(user).await;
        }

        debug!(user = %user, online, notified, "Presence announced");
        self.bus.publish(RelayEvent::PresenceChanged {
            user,
            online,
            notified,
        });
        notified
    }

    /// Current presence of `targets`, as frames ready to send to a watcher.
    pub async fn snapshot(&self, targets: &[UserId]) -> Vec<ServerFrame> {
        let mut frames = Vec::with_capacity(targets.len());
        for target in targets {
            frames.push(ServerFrame::PresenceUpdate(PresenceUpdate {
                user_id: *target,
                is_online: self.registry.is_online(*target).await,
                last_seen: None,
            }));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::{ContactBook, EveryoneOnline};

    #[tokio::test]
    async fn test_announce_reaches_online_contacts_only() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let book = Arc::new(ContactBook::new());
        let tracker = PresenceTracker::new(
            Arc::clone(&registry),
            book.clone(),
            Arc::new(EventBus::new()),
        );

        let (c2, mut rx2) = registry.open().await;
        let (c3, mut rx3) = registry.open().await;
        registry.bind(c2, UserId(2)).await.unwrap();
        registry.bind(c3, UserId(3)).await.unwrap();

        // 2 is a contact of 1, 3 is not; 4 is a contact but offline.
        book.record_contact(UserId(1), UserId(2)).await;
        book.record_contact(UserId(1), UserId(4)).await;

        assert_eq!(tracker.announce(UserId(1), true).await, 1);
        let ServerFrame::PresenceUpdate(update) = rx2.try_recv().unwrap() else {
            panic!("expected presence_update");
        };
        assert_eq!(update.user_id, UserId(1));
        assert!(update.is_online);
        assert!(update.last_seen.is_none());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_carries_last_seen_and_forgets_watches() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let book = Arc::new(ContactBook::new());
        let tracker = PresenceTracker::new(
            Arc::clone(&registry),
            book.clone(),
            Arc::new(EventBus::new()),
        );
        let (c2, mut rx2) = registry.open().await;
        registry.bind(c2, UserId(2)).await.unwrap();
        book.record_contact(UserId(1), UserId(2)).await;
        book.watch(UserId(1), vec![UserId(3)]).await;

        tracker.announce(UserId(1), false).await;

        let ServerFrame::PresenceUpdate(update) = rx2.try_recv().unwrap() else {
            panic!("expected presence_update");
        };
        assert!(!update.is_online);
        assert!(update.last_seen.is_some());
        // The watch on 3 is gone; the conversation with 2 is not.
        assert!(book.audience(UserId(3)).await.is_empty());
        assert!(book.audience(UserId(2)).await.contains(&UserId(1)));
        assert!(book.audience(UserId(1)).await.contains(&UserId(2)));
    }

    #[tokio::test]
    async fn test_everyone_scope_skips_the_user_itself() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let tracker = PresenceTracker::new(
            Arc::clone(&registry),
            Arc::new(EveryoneOnline::new(Arc::clone(&registry))),
            Arc::new(EventBus::new()),
        );
        let (c1, mut rx1) = registry.open().await;
        let (c2, mut rx2) = registry.open().await;
        registry.bind(c1, UserId(1)).await.unwrap();
        registry.bind(c2, UserId(2)).await.unwrap();

        assert_eq!(tracker.announce(UserId(1), true).await, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_lock_user_is_exclusive_per_user() {
        let tracker = Arc::new(PresenceTracker::new(
            Arc::new(ConnectionRegistry::new(8)),
            Arc::new(ContactBook::new()),
            Arc::new(EventBus::new()),
        ));

        let guard = tracker.lock_user(UserId(7)).await;
        let contender = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let _guard = tracker.lock_user(UserId(7)).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let tracker = PresenceTracker::new(
            Arc::clone(&registry),
            Arc::new(ContactBook::new()),
            Arc::new(EventBus::new()),
        );
        let (c1, _rx1) = registry.open().await;
        registry.bind(c1, UserId(1)).await.unwrap();

        let frames = tracker.snapshot(&[UserId(1), UserId(2)]).await;
        let online: Vec<bool> = frames
            .iter()
            .map(|f| match f {
                ServerFrame::PresenceUpdate(p) => p.is_online,
                _ => panic!("expected presence_update"),
            })
            .collect();
        assert_eq!(online, vec![true, false]);
    }
}
