//! Who cares about a user's presence.
//!
//! The relay has no social graph. An [`AudienceResolver`] answers "who
//! should hear that this user came online or went offline".
//! [`ContactBook`] scopes presence to conversation partners it has seen on
//! the relay plus explicit watchers; [`EveryoneOnline`] announces to every
//! connected user.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use tokio::sync::RwLock;

use kultura_shared::types::UserId;

use crate::registry::ConnectionRegistry;

pub trait AudienceResolver: Send + Sync {
    /// Users that should receive `user`'s presence transitions.
    fn audience(&self, user: UserId) -> BoxFuture<'_, HashSet<UserId>>;

    /// Two users exchanged an envelope.
    fn record_contact(&self, _a: UserId, _b: UserId) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }

    /// `watcher` asked to follow the presence of `targets`.
    fn watch(&self, _watcher: UserId, _targets: Vec<UserId>) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }

    /// `user` went fully offline; drop their explicit watches.
    fn forget(&self, _user: UserId) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }
}

#[derive(Default)]
struct Contacts {
    /// user -> conversation partners, symmetric, kept across reconnects
    partners: HashMap<UserId, HashSet<UserId>>,
    /// target -> users explicitly watching the target
    watchers: HashMap<UserId, HashSet<UserId>>,
    /// user -> targets the user explicitly watches
    watching: HashMap<UserId, HashSet<UserId>>,
}

impl Contacts {
    fn pair(&mut self, a: UserId, b: UserId) {
        if a == b {
            return;
        }
        self.partners.entry(a).or_default().insert(b);
        self.partners.entry(b).or_default().insert(a);
    }

    fn follow(&mut self, watcher: UserId, target: UserId) {
        if watcher == target {
            return;
        }
        self.watchers.entry(target).or_default().insert(watcher);
        self.watching.entry(watcher).or_default().insert(target);
    }

    fn unfollow_all(&mut self, watcher: UserId) {
        let Some(targets) = self.watching.remove(&watcher) else {
            return;
        };
        for target in targets {
            let emptied = match self.watchers.get_mut(&target) {
                Some(set) => {
                    set.remove(&watcher);
                    set.is_empty()
                }
                None => false,
            };
            if emptied {
                self.watchers.remove(&target);
            }
        }
    }
}

/// Conversation-scoped audience, process lifetime only.
///
/// Partners learned from routed envelopes stay paired for the life of the
/// process. Explicit watches last until the watcher goes fully offline.
#[derive(Default)]
pub struct ContactBook {
    contacts: RwLock<Contacts>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudienceResolver for ContactBook {
    fn audience(&self, user: UserId) -> BoxFuture<'_, HashSet<UserId>> {
        Box::pin(async move {
            let contacts = self.contacts.read().await;
            let mut audience = contacts.partners.get(&user).cloned().unwrap_or_default();
            if let Some(watchers) = contacts.watchers.get(&user) {
                audience.extend(watchers.iter().copied());
            }
            audience
        })
    }

    fn record_contact(&self, a: UserId, b: UserId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.contacts.write().await.pair(a, b);
        })
    }

    fn watch(&self, watcher: UserId, targets: Vec<UserId>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut contacts = self.contacts.write().await;
            for target in targets {
                contacts.follow(watcher, target);
            }
        })
    }

    fn forget(&self, user: UserId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.contacts.write().await.unfollow_all(user);
        })
    }
}

/// Announce to every online user.
pub struct EveryoneOnline {
    registry: Arc<ConnectionRegistry>,
}

impl EveryoneOnline {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl AudienceResolver for EveryoneOnline {
    fn audience(&self, user: UserId) -> BoxFuture<'_, HashSet<UserId>> {
        Box::pin(async move {
            self.registry
                .online_users()
                .await
                .into_iter()
                .filter(|u| *u != user)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> HashSet<UserId> {
        raw.iter().copied().map(UserId).collect()
    }

    #[tokio::test]
    async fn test_contacts_are_symmetric() {
        let book = ContactBook::new();
        book.record_contact(UserId(1), UserId(2)).await;

        assert_eq!(book.audience(UserId(1)).await, ids(&[2]));
        assert_eq!(book.audience(UserId(2)).await, ids(&[1]));
        assert!(book.audience(UserId(3)).await.is_empty());
    }

    #[tokio::test]
    async fn test_watch_is_one_way_and_ignores_self() {
        let book = ContactBook::new();
        book.watch(UserId(1), vec![UserId(2), UserId(3), UserId(1)]).await;

        assert_eq!(book.audience(UserId(2)).await, ids(&[1]));
        assert_eq!(book.audience(UserId(3)).await, ids(&[1]));
        assert!(book.audience(UserId(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_keeps_partners_across_reconnect() {
        let book = ContactBook::new();
        book.record_contact(UserId(1), UserId(2)).await;
        book.watch(UserId(1), vec![UserId(3)]).await;

        // 1 goes offline, comes back, then 2 goes offline.
        book.forget(UserId(1)).await;

        assert_eq!(book.audience(UserId(2)).await, ids(&[1]));
        assert_eq!(book.audience(UserId(1)).await, ids(&[2]));
        assert!(book.audience(UserId(3)).await.is_empty());
    }

    #[tokio::test]
    async fn test_watch_and_partner_overlap() {
        let book = ContactBook::new();
        book.record_contact(UserId(1), UserId(2)).await;
        book.watch(UserId(3), vec![UserId(2)]).await;
        book.watch(UserId(1), vec![UserId(2)]).await;

        assert_eq!(book.audience(UserId(2)).await, ids(&[1, 3]));

        book.forget(UserId(1)).await;
        book.forget(UserId(3)).await;
        assert_eq!(book.audience(UserId(2)).await, ids(&[1]));
    }

    #[tokio::test]
    async fn test_everyone_online() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let (c1, _rx1) = registry.open().await;
        let (c2, _rx2) = registry.open().await;
        registry.bind(c1, UserId(1)).await.unwrap();
        registry.bind(c2, UserId(2)).await.unwrap();

        let everyone = EveryoneOnline::new(Arc::clone(&registry));
        assert_eq!(everyone.audience(UserId(1)).await, ids(&[2]));
        assert_eq!(everyone.audience(UserId(3)).await, ids(&[1, 2]));
    }
}
