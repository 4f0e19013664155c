use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use kultura_shared::types::{ConnectionId, UserId};

/// Errors raised while serving a single connection.
///
/// None of these escape the connection they occurred on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No valid handshake within the timeout")]
    HandshakeTimeout,

    #[error("Credential rejected for user {0}")]
    Unauthorized(UserId),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Envelope received on unauthenticated connection {0}")]
    UnboundSender(ConnectionId),

    #[error("Connection {connection} is already bound to user {bound}, not {requested}")]
    AlreadyBound {
        connection: ConnectionId,
        bound: UserId,
        requested: UserId,
    },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Envelope claims sender {claimed} but connection is bound to {bound}")]
    SenderMismatch { claimed: UserId, bound: UserId },

    #[error("Presence updates are only emitted by the relay")]
    PresenceNotAccepted,

    #[error("Envelope rate limit exceeded")]
    RateLimited,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Stable code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::HandshakeTimeout => "handshake_timeout",
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::MalformedEnvelope(_) => "malformed_envelope",
            RelayError::UnboundSender(_) => "unbound_sender",
            RelayError::AlreadyBound { .. } => "already_bound",
            RelayError::UnknownConnection(_) => "unknown_connection",
            RelayError::SenderMismatch { .. } => "sender_mismatch",
            RelayError::PresenceNotAccepted => "presence_not_accepted",
            RelayError::RateLimited => "rate_limited",
            RelayError::Transport(_) => "transport_error",
        }
    }

    /// Whether the error ends the connection instead of dropping one envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::HandshakeTimeout
                | RelayError::Unauthorized(_)
                | RelayError::UnboundSender(_)
                | RelayError::UnknownConnection(_)
                | RelayError::Transport(_)
        )
    }
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        };
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_errors_are_not_fatal() {
        assert!(!RelayError::MalformedEnvelope("x".into()).is_fatal());
        assert!(!RelayError::PresenceNotAccepted.is_fatal());
        assert!(!RelayError::RateLimited.is_fatal());
        assert!(!RelayError::SenderMismatch {
            claimed: UserId(1),
            bound: UserId(2)
        }
        .is_fatal());
    }

    #[test]
    fn test_protocol_violations_are_fatal() {
        assert!(RelayError::UnboundSender(ConnectionId::new()).is_fatal());
        assert!(RelayError::Unauthorized(UserId(1)).is_fatal());
        assert_eq!(RelayError::HandshakeTimeout.code(), "handshake_timeout");
    }
}
