//! Bidirectional frame transport under a session.
//!
//! The session state machine only sees [`TransportFrame`]s, so it can be
//! driven by a real WebSocket or by an in-memory pair in tests.

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::future::BoxFuture;

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

pub trait Transport: Send {
    /// Next inbound frame, or `None` once the peer is gone.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<TransportFrame, RelayError>>>;

    fn send(&mut self, frame: TransportFrame) -> BoxFuture<'_, Result<(), RelayError>>;
}

/// An upgraded axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<TransportFrame, RelayError>>> {
        Box::pin(async move {
            let message = self.socket.recv().await?;
            Some(
                message
                    .map(from_message)
                    .map_err(|e| RelayError::Transport(e.to_string())),
            )
        })
    }

    fn send(&mut self, frame: TransportFrame) -> BoxFuture<'_, Result<(), RelayError>> {
        Box::pin(async move {
            self.socket
                .send(into_message(frame))
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))
        })
    }
}

fn from_message(message: Message) -> TransportFrame {
    match message {
        Message::Text(text) => TransportFrame::Text(text),
        Message::Binary(data) => TransportFrame::Binary(data),
        Message::Ping(data) => TransportFrame::Ping(data),
        Message::Pong(data) => TransportFrame::Pong(data),
        Message::Close(frame) => TransportFrame::Close(frame.map(|f| CloseInfo {
            code: f.code,
            reason: f.reason.into_owned(),
        })),
    }
}

fn into_message(frame: TransportFrame) -> Message {
    match frame {
        TransportFrame::Text(text) => Message::Text(text),
        TransportFrame::Binary(data) => Message::Binary(data),
        TransportFrame::Ping(data) => Message::Ping(data),
        TransportFrame::Pong(data) => Message::Pong(data),
        TransportFrame::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: info.code,
            reason: Cow::Owned(info.reason),
        })),
    }
}
