//! Signaling relay error types.
//!
//! Every error that reaches a client goes through [`RelayError::client_message`].
//! Internal details (store failures, channel errors) are logged server-side
//! and replaced by a generic message on the wire.

use crate::protocol::ProtocolError;
use crate::store::StoreError;
use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Participant mirror operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Frame could not be parsed or a field failed validation.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Frame carried a `type` the relay does not handle.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// `roomId` failed the room identifier grammar.
    #[error("Invalid room id")]
    InvalidRoomId,

    /// Non-join message on a connection that has not joined.
    #[error("Connection has not joined a room")]
    NotJoined,

    /// Sender is no longer a current member of its bound room.
    #[error("Sender is not a current room member")]
    NotAuthorized,

    /// Join attempted on a connection that already joined.
    #[error("Connection already joined a room")]
    AlreadyJoined,

    /// Join attempted while a previous join is still being verified.
    #[error("Join already in progress")]
    JoinInProgress,

    /// Room is at capacity.
    #[error("Room at capacity: {0}")]
    RoomFull(usize),

    /// Conflict error (e.g., identity already present in the room).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Target of a signaling message is absent or not accepting messages.
    #[error("Peer unreachable")]
    PeerUnreachable,

    /// Credential verification failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Room actor shut down while a request was in flight.
    #[error("Room closed")]
    RoomClosed,

    /// Actor or channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Store(_)
            | RelayError::Config(_)
            | RelayError::RoomClosed
            | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RelayError::MalformedMessage(detail) => format!("Invalid message: {detail}"),
            RelayError::UnknownMessageType(_) => "Unknown message type".to_string(),
            RelayError::InvalidRoomId => "Invalid roomId".to_string(),
            RelayError::NotJoined => "Not authorized: Join a room first".to_string(),
            RelayError::NotAuthorized => "Not authorized".to_string(),
            RelayError::AlreadyJoined => "Already joined a room".to_string(),
            RelayError::JoinInProgress => "Join already in progress".to_string(),
            RelayError::RoomFull(_) => "Room is full".to_string(),
            RelayError::PeerUnreachable => "Peer is unreachable".to_string(),
            RelayError::AuthenticationFailed => "Authentication failed".to_string(),
            RelayError::Conflict(msg) => msg.clone(),
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            RelayError::Store(_) => "store",
            RelayError::Config(_) => "config",
            RelayError::MalformedMessage(_) => "malformed",
            RelayError::UnknownMessageType(_) => "unknown_type",
            RelayError::InvalidRoomId => "invalid_room_id",
            RelayError::NotJoined => "not_joined",
            RelayError::NotAuthorized => "not_authorized",
            RelayError::AlreadyJoined => "already_joined",
            RelayError::JoinInProgress => "join_in_progress",
            RelayError::RoomFull(_) => "room_full",
            RelayError::Conflict(_) => "conflict",
            RelayError::PeerUnreachable => "peer_unreachable",
            RelayError::AuthenticationFailed => "auth_failed",
            RelayError::RoomClosed => "room_closed",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownType(message_type) => {
                RelayError::UnknownMessageType(message_type)
            }
            other => RelayError::MalformedMessage(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err = RelayError::Store(StoreError::Redis(
            "connection refused at 10.0.0.7:6379".to_string(),
        ));
        assert!(!store_err.client_message().contains("10.0.0.7"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let internal = RelayError::Internal("channel send failed: closed".to_string());
        assert_eq!(internal.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_room_full_message_omits_capacity() {
        let err = RelayError::RoomFull(8);
        assert_eq!(err.client_message(), "Room is full");
        assert_eq!(format!("{err}"), "Room at capacity: 8");
    }

    #[test]
    fn test_authorization_messages_are_generic() {
        assert_eq!(
            RelayError::NotJoined.client_message(),
            "Not authorized: Join a room first"
        );
        assert_eq!(RelayError::NotAuthorized.client_message(), "Not authorized");
        assert_eq!(
            RelayError::PeerUnreachable.client_message(),
            "Peer is unreachable"
        );
    }

    #[test]
    fn test_unknown_type_is_not_echoed() {
        let err: RelayError = ProtocolError::UnknownType("<script>".to_string()).into();
        assert!(matches!(err, RelayError::UnknownMessageType(_)));
        assert_eq!(err.client_message(), "Unknown message type");
    }

    #[test]
    fn test_protocol_errors_become_malformed() {
        let err: RelayError = ProtocolError::MissingType.into();
        assert!(matches!(err, RelayError::MalformedMessage(_)));
        assert_eq!(err.as_label(), "malformed");
    }
}
