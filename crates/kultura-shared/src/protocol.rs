//! Wire frames exchanged over a relay connection.
//!
//! Every frame is a JSON object internally tagged by `type`. Inbound field
//! names also accept the camelCase spellings used by the mobile client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{MessageId, TempId, UserId};

// ---------------------------------------------------------------------------
// Client -> relay
// ---------------------------------------------------------------------------

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Identity binding; must be the first frame on a connection.
    Auth(Handshake),

    #[serde(alias = "message")]
    ChatMessage(ChatMessage),

    Typing(TypingSignal),

    #[serde(alias = "read")]
    ReadReceipt(ReadReceipt),

    /// Only ever emitted by the relay. Parsed so it can be refused explicitly.
    PresenceUpdate(PresenceUpdate),

    /// Ask for presence updates about specific users.
    WatchPresence(WatchPresence),

    /// Application heartbeat.
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, alias = "tempId", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    /// Persisted id, when the client already stored the message through the API.
    #[serde(default, alias = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, alias = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(alias = "receiverId")]
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, alias = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Quoted message a chat message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(alias = "receiverId")]
    pub receiver_id: UserId,
    #[serde(default, alias = "isTyping")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    #[serde(default, alias = "readerId", skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
    /// Author of the messages that were read.
    #[serde(alias = "senderId")]
    pub sender_id: UserId,
    #[serde(default, alias = "messageIds")]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    #[serde(alias = "isOnline")]
    pub is_online: bool,
    #[serde(default, alias = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPresence {
    #[serde(alias = "userIds")]
    pub user_ids: Vec<UserId>,
}

impl ClientFrame {
    /// Decode a text frame, refusing anything over [`MAX_FRAME_SIZE`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn parse_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::parse(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Auth(_) => "auth",
            ClientFrame::ChatMessage(_) => "chat_message",
            ClientFrame::Typing(_) => "typing",
            ClientFrame::ReadReceipt(_) => "read_receipt",
            ClientFrame::PresenceUpdate(_) => "presence_update",
            ClientFrame::WatchPresence(_) => "watch_presence",
            ClientFrame::Ping => "ping",
        }
    }
}

// ---------------------------------------------------------------------------
// Relay -> client
// ---------------------------------------------------------------------------

/// Frames the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess { user_id: UserId },
    AuthError { message: String },
    ChatMessage(ChatMessage),
    Typing(TypingSignal),
    ReadReceipt(ReadReceipt),
    PresenceUpdate(PresenceUpdate),
    MessageAck(MessageAck),
    Pong,
    /// A single envelope was refused; the connection stays open.
    Error { code: String, message: String },
}

/// Confirmation to the sender that the relay processed a chat message.
///
/// Acknowledges the send attempt, not receipt: it is emitted whether or not
/// the receiver was online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: Option<MessageId>,
    pub temp_id: Option<TempId>,
    pub receiver_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
