//! Envelope routing.
//!
//! `route` is called inline by the sending connection's session task, one
//! envelope at a time, and every target connection has a FIFO queue, so
//! envelopes from one sender reach a receiver in the order they were routed.
//! Delivery is best-effort: nothing is queued for offline users and nothing
//! is retried.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use kultura_shared::constants::{MAX_CONTENT_SIZE, MAX_ID_LIST};
use kultura_shared::protocol::{
    ChatMessage, ClientFrame, MessageAck, ReadReceipt, ServerFrame, TypingSignal, WatchPresence,
};
use kultura_shared::types::{ConnectionId, UserId};

use crate::audience::AudienceResolver;
use crate::bus::{DeliveryKind, EventBus, RelayEvent};
use crate::error::RelayError;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;

/// What happened to a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Receiver connections the envelope was queued on.
    pub delivered: usize,
    /// Frames sent back to the originating connection (acks, snapshots).
    pub replies: usize,
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    audience: Arc<dyn AudienceResolver>,
    presence: Arc<PresenceTracker>,
    bus: Arc<EventBus>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        audience: Arc<dyn AudienceResolver>,
        presence: Arc<PresenceTracker>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            audience,
            presence,
            bus,
        }
    }

    pub async fn route(
        &self,
        frame: ClientFrame,
        from: ConnectionId,
    ) -> Result<RouteOutcome, RelayError> {
        let sender = self
            .registry
            .user_for(from)
            .await
            .ok_or(RelayError::UnboundSender(from))?;

        match frame {
            ClientFrame::ChatMessage(msg) => self.route_chat(msg, sender, from).await,
            ClientFrame::Typing(signal) => self.route_typing(signal, sender).await,
            ClientFrame::ReadReceipt(receipt) => self.route_receipt(receipt, sender).await,
            ClientFrame::WatchPresence(watch) => self.watch_presence(watch, sender, from).await,
            ClientFrame::PresenceUpdate(_) => Err(RelayError::PresenceNotAccepted),
            ClientFrame::Auth(_) | ClientFrame::Ping => Err(RelayError::MalformedEnvelope(
                "control frame is not routable".into(),
            )),
        }
    }

    async fn route_chat(
        &self,
        mut msg: ChatMessage,
        sender: UserId,
        from: ConnectionId,
    ) -> Result<RouteOutcome, RelayError> {
        check_sender(msg.sender_id, sender)?;
        if msg.content.trim().is_empty() {
            return Err(RelayError::MalformedEnvelope("empty content".into()));
        }
        if msg.content.len() > MAX_CONTENT_SIZE {
            return Err(RelayError::MalformedEnvelope(format!(
                "content is {} bytes (max {MAX_CONTENT_SIZE})",
                msg.content.len()
            )));
        }

        let created_at = *msg.created_at.get_or_insert_with(Utc::now);
        msg.sender_id = Some(sender);
        let receiver = msg.receiver_id;
        let ack = MessageAck {
            message_id: msg.message_id,
            temp_id: msg.temp_id,
            receiver_id: receiver,
            created_at,
        };

        let delivered = self
            .registry
            .send_to_user(receiver, &ServerFrame::ChatMessage(msg))
            .await;

        if delivered > 0 {
            // A sent message ends the sender's typing indicator.
            let stop_typing = ServerFrame::Typing(TypingSignal {
                user_id: Some(sender),
                receiver_id: receiver,
                is_typing: false,
            });
            self.registry.send_to_user(receiver, &stop_typing).await;
        }

        let acked = self
            .registry
            .send_to_connection(from, ServerFrame::MessageAck(ack))
            .await;

        self.audience.record_contact(sender, receiver).await;
        self.delivered(DeliveryKind::ChatMessage, sender, receiver, delivered);

        Ok(RouteOutcome {
            delivered,
            replies: usize::from(acked),
        })
    }

    async fn route_typing(
        &self,
        mut signal: TypingSignal,
        sender: UserId,
    ) -> Result<RouteOutcome, RelayError> {
        check_sender(signal.user_id, sender)?;
        signal.user_id = Some(sender);
        let receiver = signal.receiver_id;

        let delivered = self
            .registry
            .send_to_user(receiver, &ServerFrame::Typing(signal))
            .await;

        self.audience.record_contact(sender, receiver).await;
        self.delivered(DeliveryKind::Typing, sender, receiver, delivered);
        Ok(RouteOutcome {
            delivered,
            replies: 0,
        })
    }

    async fn route_receipt(
        &self,
        mut receipt: ReadReceipt,
        reader: UserId,
    ) -> Result<RouteOutcome, RelayError> {
        check_sender(receipt.reader_id, reader)?;
        if receipt.message_ids.len() > MAX_ID_LIST {
            return Err(RelayError::MalformedEnvelope(format!(
                "{} message ids (max {MAX_ID_LIST})",
                receipt.message_ids.len()
            )));
        }
        receipt.reader_id = Some(reader);
        let author = receipt.sender_id;

        let delivered = self
            .registry
            .send_to_user(author, &ServerFrame::ReadReceipt(receipt))
            .await;

        self.audience.record_contact(reader, author).await;
        self.delivered(DeliveryKind::ReadReceipt, reader, author, delivered);
        Ok(RouteOutcome {
            delivered,
            replies: 0,
        })
    }

    async fn watch_presence(
        &self,
        watch: WatchPresence,
        watcher: UserId,
        from: ConnectionId,
    ) -> Result<RouteOutcome, RelayError> {
        if watch.user_ids.len() > MAX_ID_LIST {
            return Err(RelayError::MalformedEnvelope(format!(
                "{} user ids (max {MAX_ID_LIST})",
                watch.user_ids.len()
            )));
        }

        let targets: Vec<UserId> = watch
            .user_ids
            .into_iter()
            .filter(|target| *target != watcher)
            .collect();
        self.audience.watch(watcher, targets.clone()).await;

        let mut replies = 0;
        for frame in self.presence.snapshot(&targets).await {
            if self.registry.send_to_connection(from, frame).await {
                replies += 1;
            }
        }
        debug!(user = %watcher, watched = targets.len(), "Presence watch registered");
        Ok(RouteOutcome {
            delivered: 0,
            replies,
        })
    }

    fn delivered(&self, kind: DeliveryKind, from: UserId, to: UserId, connections: usize) {
        if connections == 0 {
            debug!(?kind, from = %from, to = %to, "Receiver offline, not delivered live");
        }
        self.bus.publish(RelayEvent::Delivered {
            kind,
            from,
            to,
            connections,
        });
    }
}

/// Identity fields are optional on input, but when present must name the
/// connection's own user.
fn check_sender(claimed: Option<UserId>, bound: UserId) -> Result<(), RelayError> {
    match claimed {
        Some(claimed) if claimed != bound => Err(RelayError::SenderMismatch { claimed, bound }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use kultura_shared::protocol::{Handshake, PresenceUpdate};

    use super::*;
    use crate::audience::ContactBook;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        book: Arc<ContactBook>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let book = Arc::new(ContactBook::new());
        let bus = Arc::new(EventBus::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            book.clone(),
            Arc::clone(&bus),
        ));
        let router = MessageRouter::new(Arc::clone(&registry), book.clone(), presence, bus);
        Fixture {
            registry,
            book,
            router,
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        user: u64,
    ) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (conn, rx) = registry.open().await;
        registry.bind(conn, UserId(user)).await.unwrap();
        (conn, rx)
    }

    fn chat(temp_id: u64, to: u64, content: &str) -> ClientFrame {
        ClientFrame::ChatMessage(ChatMessage {
            temp_id: Some(temp_id),
            message_id: None,
            sender_id: None,
            receiver_id: UserId(to),
            content: content.to_string(),
            reply_to: None,
            created_at: None,
        })
    }

    fn typing(to: u64, is_typing: bool) -> ClientFrame {
        ClientFrame::Typing(TypingSignal {
            user_id: None,
            receiver_id: UserId(to),
            is_typing,
        })
    }

    #[tokio::test]
    async fn test_chat_delivered_and_acked() {
        let f = fixture();
        let (c1, mut rx_a) = connect(&f.registry, 1).await;
        let (_c2, mut rx_b) = connect(&f.registry, 2).await;

        let outcome = f.router.route(chat(42, 2, "hi"), c1).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome {
                delivered: 1,
                replies: 1
            }
        );

        let ServerFrame::ChatMessage(msg) = rx_b.try_recv().unwrap() else {
            panic!("expected chat_message");
        };
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.sender_id, Some(UserId(1)));
        assert!(msg.created_at.is_some());
        // Followed by the typing reset.
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerFrame::Typing(TypingSignal {
                is_typing: false,
                ..
            })
        ));

        let ServerFrame::MessageAck(ack) = rx_a.try_recv().unwrap() else {
            panic!("expected message_ack");
        };
        assert_eq!(ack.temp_id, Some(42));
        assert_eq!(ack.receiver_id, UserId(2));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_to_offline_user_still_acked() {
        let f = fixture();
        let (c1, mut rx_a) = connect(&f.registry, 1).await;

        let outcome = f.router.route(chat(7, 2, "are you there"), c1).await.unwrap();
        assert_eq!(outcome.delivered, 0);

        let ServerFrame::MessageAck(ack) = rx_a.try_recv().unwrap() else {
            panic!("expected message_ack");
        };
        assert_eq!(ack.temp_id, Some(7));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_reaches_all_receiver_devices() {
        let f = fixture();
        let (c1, _rx_a) = connect(&f.registry, 1).await;
        let (_phone, mut rx_phone) = connect(&f.registry, 2).await;
        let (_tablet, mut rx_tablet) = connect(&f.registry, 2).await;

        let outcome = f.router.route(chat(1, 2, "hello"), c1).await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(matches!(rx_phone.try_recv(), Ok(ServerFrame::ChatMessage(_))));
        assert!(matches!(rx_tablet.try_recv(), Ok(ServerFrame::ChatMessage(_))));
    }

    #[tokio::test]
    async fn test_blank_chat_is_malformed() {
        let f = fixture();
        let (c1, mut rx_a) = connect(&f.registry, 1).await;
        let err = f.router.route(chat(1, 2, "   "), c1).await.unwrap_err();
        assert!(matches!(err, RelayError::MalformedEnvelope(_)));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spoofed_sender_rejected() {
        let f = fixture();
        let (c1, _rx_a) = connect(&f.registry, 1).await;
        let (_c2, mut rx_b) = connect(&f.registry, 2).await;

        let frame = ClientFrame::ChatMessage(ChatMessage {
            sender_id: Some(UserId(3)),
            ..match chat(1, 2, "spoof") {
                ClientFrame::ChatMessage(msg) => msg,
                _ => unreachable!(),
            }
        });
        let err = f.router.route(frame, c1).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::SenderMismatch {
                claimed: UserId(3),
                bound: UserId(1)
            }
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unbound_sender_rejected() {
        let f = fixture();
        let (conn, _rx) = f.registry.open().await;
        let (_c2, mut rx_b) = connect(&f.registry, 2).await;

        let err = f.router.route(chat(1, 2, "early"), conn).await.unwrap_err();
        assert!(matches!(err, RelayError::UnboundSender(_)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typing_order_preserved() {
        let f = fixture();
        let (c1, _rx_a) = connect(&f.registry, 1).await;
        let (_c2, mut rx_b) = connect(&f.registry, 2).await;

        f.router.route(typing(2, true), c1).await.unwrap();
        f.router.route(typing(2, false), c1).await.unwrap();

        let states: Vec<bool> = [rx_b.try_recv().unwrap(), rx_b.try_recv().unwrap()]
            .into_iter()
            .map(|frame| match frame {
                ServerFrame::Typing(t) => {
                    assert_eq!(t.user_id, Some(UserId(1)));
                    t.is_typing
                }
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(states, vec![true, false]);
    }

    #[tokio::test]
    async fn test_typing_to_offline_user_is_a_no_op() {
        let f = fixture();
        let (c1, mut rx_a) = connect(&f.registry, 1).await;

        let outcome = f.router.route(typing(2, true), c1).await.unwrap();
        assert_eq!(outcome.delivered, 0);
        assert!(rx_a.try_recv().is_err());

        // Nothing was kept for later: B connecting afterwards gets nothing.
        let (_c2, mut rx_b) = connect(&f.registry, 2).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_receipt_goes_to_author() {
        let f = fixture();
        let (reader, _rx_reader) = connect(&f.registry, 2).await;
        let (_author, mut rx_author) = connect(&f.registry, 1).await;

        let receipt = ClientFrame::ReadReceipt(ReadReceipt {
            reader_id: None,
            sender_id: UserId(1),
            message_ids: vec![10, 11],
        });
        f.router.route(receipt, reader).await.unwrap();

        let ServerFrame::ReadReceipt(r) = rx_author.try_recv().unwrap() else {
            panic!("expected read_receipt");
        };
        assert_eq!(r.reader_id, Some(UserId(2)));
        assert_eq!(r.message_ids, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_read_receipt_without_ids_still_forwarded() {
        let f = fixture();
        let (reader, _rx_reader) = connect(&f.registry, 2).await;
        let (_author, mut rx_author) = connect(&f.registry, 1).await;

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "read", "senderId": 1}"#).unwrap();
        let outcome = f.router.route(frame, reader).await.unwrap();
        assert_eq!(outcome.delivered, 1);

        let ServerFrame::ReadReceipt(r) = rx_author.try_recv().unwrap() else {
            panic!("expected read_receipt");
        };
        assert_eq!(r.reader_id, Some(UserId(2)));
        assert!(r.message_ids.is_empty());
    }

    #[tokio::test]
    async fn test_presence_from_client_refused() {
        let f = fixture();
        let (c1, _rx) = connect(&f.registry, 1).await;
        let frame = ClientFrame::PresenceUpdate(PresenceUpdate {
            user_id: UserId(1),
            is_online: false,
            last_seen: None,
        });
        assert!(matches!(
            f.router.route(frame, c1).await,
            Err(RelayError::PresenceNotAccepted)
        ));
    }

    #[tokio::test]
    async fn test_control_frames_not_routable() {
        let f = fixture();
        let (c1, _rx) = connect(&f.registry, 1).await;
        let frame = ClientFrame::Auth(Handshake {
            user_id: UserId(1),
            token: "t".into(),
        });
        assert!(matches!(
            f.router.route(frame, c1).await,
            Err(RelayError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_presence_replies_with_snapshot() {
        let f = fixture();
        let (c1, mut rx_a) = connect(&f.registry, 1).await;
        let (_c2, _rx_b) = connect(&f.registry, 2).await;

        let watch = ClientFrame::WatchPresence(WatchPresence {
            user_ids: vec![UserId(2), UserId(3), UserId(1)],
        });
        let outcome = f.router.route(watch, c1).await.unwrap();
        assert_eq!(outcome.replies, 2);

        let mut seen = Vec::new();
        while let Ok(ServerFrame::PresenceUpdate(p)) = rx_a.try_recv() {
            seen.push((p.user_id, p.is_online));
        }
        assert_eq!(seen, vec![(UserId(2), true), (UserId(3), false)]);
        assert!(f.book.audience(UserId(3)).await.contains(&UserId(1)));
    }

    #[tokio::test]
    async fn test_routing_records_contacts() {
        let f = fixture();
        let (c1, _rx_a) = connect(&f.registry, 1).await;
        f.router.route(typing(2, true), c1).await.unwrap();

        assert!(f.book.audience(UserId(1)).await.contains(&UserId(2)));
        assert!(f.book.audience(UserId(2)).await.contains(&UserId(1)));
    }
}
