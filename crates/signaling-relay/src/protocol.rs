//! JSON wire protocol.
//!
//! Every frame is a JSON object with a string `type` field.
//!
//! | Direction | `type` | Fields |
//! |-----------|--------|--------|
//! | client → relay | `join` | `roomId`, `credential`, `name?`, `profileImageUrl?` |
//! | client → relay | `leave` | none |
//! | client → relay | `offer` / `answer` / `candidate` | `targetUserId`, opaque payload |
//! | client → relay | `updateVoiceStatus` | `updates: {isMicActive?, isSpeaking?}` |
//! | relay → client | `roomJoined` | `roomId`, `users` |
//! | relay → client | `userJoined` | member fields |
//! | relay → client | `userLeft` | `userId` |
//! | relay → client | `voiceStatusUpdate` | `userId`, `isMicActive?`, `isSpeaking?` |
//! | relay → client | `offer` / `answer` / `candidate` | `fromUserId`, opaque payload |
//! | relay → client | `error` | `message` |
//!
//! Signaling payloads are forwarded verbatim except for the routing envelope
//! (`type`, `roomId`, `targetUserId`, `fromUserId`), which the relay strips
//! and re-stamps.

use common::secret::SecretString;
use common::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Maximum length of the optional display name supplied at join.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of the optional profile image URL supplied at join.
pub const MAX_PROFILE_IMAGE_URL_LEN: usize = 2048;

/// Envelope fields removed from signaling payloads before forwarding.
const SIGNAL_ENVELOPE_FIELDS: [&str; 4] = ["type", "roomId", "targetUserId", "fromUserId"];

/// Serialized server frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Errors from parsing a client frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not valid JSON")]
    InvalidJson,

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing message type")]
    MissingType,

    #[error("unknown message type")]
    UnknownType(String),

    #[error("{0}")]
    InvalidField(String),
}

/// Parsed client frame.
#[derive(Debug)]
pub enum ClientMessage {
    Join(JoinRequest),
    Leave,
    Signal(SignalMessage),
    UpdateVoiceStatus(VoiceStatusUpdates),
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` for invalid JSON, a missing or unknown `type`,
    /// or fields that fail validation.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let message_type = match fields.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        match message_type.as_str() {
            "join" => {
                let request: JoinRequest = serde_json::from_value(Value::Object(fields))
                    .map_err(|e| ProtocolError::InvalidField(e.to_string()))?;
                request.validate_profile()?;
                Ok(ClientMessage::Join(request))
            }
            "leave" => Ok(ClientMessage::Leave),
            "offer" | "answer" | "candidate" => {
                let kind = SignalKind::from_type(&message_type)
                    .ok_or_else(|| ProtocolError::UnknownType(message_type.clone()))?;
                let target = match fields.get("targetUserId") {
                    Some(Value::String(target)) => UserId::parse(target.as_str())
                        .map_err(|_| ProtocolError::InvalidField("invalid targetUserId".into()))?,
                    _ => return Err(ProtocolError::InvalidField("missing targetUserId".into())),
                };
                for field in SIGNAL_ENVELOPE_FIELDS {
                    fields.remove(field);
                }
                Ok(ClientMessage::Signal(SignalMessage {
                    kind,
                    target_user_id: target,
                    payload: fields,
                }))
            }
            "updateVoiceStatus" => {
                let request: VoiceStatusRequest = serde_json::from_value(Value::Object(fields))
                    .map_err(|e| ProtocolError::InvalidField(e.to_string()))?;
                Ok(ClientMessage::UpdateVoiceStatus(request.updates))
            }
            _ => Err(ProtocolError::UnknownType(message_type)),
        }
    }

    /// Bounded label for metrics and logs.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Signal(signal) => signal.kind.as_str(),
            ClientMessage::UpdateVoiceStatus(_) => "updateVoiceStatus",
        }
    }
}

/// `join` request. `roomId` is validated by the dispatcher so that a bad
/// room gets its own error message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub credential: SecretString,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

impl JoinRequest {
    fn validate_profile(&self) -> Result<(), ProtocolError> {
        if self
            .name
            .as_ref()
            .is_some_and(|n| n.chars().count() > MAX_NAME_LEN)
        {
            return Err(ProtocolError::InvalidField("name too long".into()));
        }
        if self
            .profile_image_url
            .as_ref()
            .is_some_and(|u| u.len() > MAX_PROFILE_IMAGE_URL_LEN)
        {
            return Err(ProtocolError::InvalidField(
                "profileImageUrl too long".into(),
            ));
        }
        Ok(())
    }
}

/// Signaling message kinds relayed between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    fn from_type(message_type: &str) -> Option<Self> {
        match message_type {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// Targeted signaling message with the envelope already stripped.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub target_user_id: UserId,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct VoiceStatusRequest {
    updates: VoiceStatusUpdates,
}

/// Allow-listed presence fields. Anything else in `updates` is dropped
/// during deserialization and never reaches room state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatusUpdates {
    #[serde(default)]
    pub is_mic_active: Option<bool>,
    #[serde(default)]
    pub is_speaking: Option<bool>,
}

impl VoiceStatusUpdates {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_mic_active.is_none() && self.is_speaking.is_none()
    }
}

/// Member presence as seen by other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: UserId,
    pub is_mic_active: bool,
    pub is_speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
}

/// Presence change broadcast; only the fields that were updated are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatusChange {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mic_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
}

/// Signaling payload as delivered to its target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedSignal {
    pub from_user_id: UserId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        users: Vec<MemberInfo>,
    },
    UserJoined(MemberInfo),
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: UserId,
    },
    VoiceStatusUpdate(VoiceStatusChange),
    Offer(ForwardedSignal),
    Answer(ForwardedSignal),
    Candidate(ForwardedSignal),
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Build a forwarded signaling frame stamped with the true sender.
    #[must_use]
    pub fn signal(kind: SignalKind, from_user_id: UserId, payload: Map<String, Value>) -> Self {
        let forwarded = ForwardedSignal {
            from_user_id,
            payload,
        };
        match kind {
            SignalKind::Offer => ServerMessage::Offer(forwarded),
            SignalKind::Answer => ServerMessage::Answer(forwarded),
            SignalKind::Candidate => ServerMessage::Candidate(forwarded),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize once for delivery to any number of connections.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; the relay's own types always serialize.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }

    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "roomJoined",
            ServerMessage::UserJoined(_) => "userJoined",
            ServerMessage::UserLeft { .. } => "userLeft",
            ServerMessage::VoiceStatusUpdate(_) => "voiceStatusUpdate",
            ServerMessage::Offer(_) => "offer",
            ServerMessage::Answer(_) => "answer",
            ServerMessage::Candidate(_) => "candidate",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Why the relay closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client left its room.
    Normal,
    /// Server shutting down.
    GoingAway,
    /// Client sent a binary frame.
    BinaryUnsupported,
    /// Client sent a text frame over the size ceiling.
    MessageTooLarge,
    /// No successful join before the auth deadline.
    AuthTimeout,
    /// Credential verification failed.
    AuthFailed,
    /// Client exceeded the per-connection message rate.
    RateLimited,
}

impl CloseReason {
    /// WebSocket close code sent with the close frame.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::BinaryUnsupported => 1003,
            CloseReason::MessageTooLarge => 1009,
            CloseReason::AuthTimeout => 4000,
            CloseReason::AuthFailed => 4001,
            CloseReason::RateLimited => 4002,
        }
    }

    /// Human-readable close reason (also the metrics label).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::GoingAway => "going_away",
            CloseReason::BinaryUnsupported => "binary_unsupported",
            CloseReason::MessageTooLarge => "message_too_large",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::RateLimited => "rate_limited",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;
    use serde_json::json;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[test]
    fn test_parse_join_with_profile() {
        let msg = ClientMessage::parse(
            r#"{"type":"join","roomId":"R1","credential":"tok","name":"Alice","profileImageUrl":"https://img/a.png"}"#,
        )
        .unwrap();

        let ClientMessage::Join(join) = msg else {
            panic!("expected join");
        };
        assert_eq!(join.room_id, "R1");
        assert_eq!(join.credential.expose_secret(), "tok");
        assert_eq!(join.name.as_deref(), Some("Alice"));
        assert_eq!(join.profile_image_url.as_deref(), Some("https://img/a.png"));
    }

    #[test]
    fn test_parse_join_missing_credential() {
        let err = ClientMessage::parse(r#"{"type":"join","roomId":"R1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(msg) if msg.contains("credential")));
    }

    #[test]
    fn test_parse_join_rejects_long_name() {
        let frame = json!({
            "type": "join",
            "roomId": "R1",
            "credential": "tok",
            "name": "n".repeat(MAX_NAME_LEN + 1),
        });
        let err = ClientMessage::parse(&frame.to_string()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidField("name too long".into()));
    }

    #[test]
    fn test_parse_rejects_non_object_and_bad_json() {
        assert_eq!(
            ClientMessage::parse("not json").unwrap_err(),
            ProtocolError::InvalidJson
        );
        assert_eq!(
            ClientMessage::parse("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject
        );
        assert_eq!(
            ClientMessage::parse(r#"{"roomId":"R1"}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":42}"#).unwrap_err(),
            ProtocolError::MissingType
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"kick","userId":"b"}"#).unwrap_err(),
            ProtocolError::UnknownType("kick".into())
        );
    }

    #[test]
    fn test_parse_signal_strips_envelope() {
        let msg = ClientMessage::parse(
            r#"{"type":"offer","roomId":"spoofed","targetUserId":"bob","fromUserId":"mallory","sdp":"v=0..."}"#,
        )
        .unwrap();

        let ClientMessage::Signal(signal) = msg else {
            panic!("expected signal");
        };
        assert_eq!(signal.kind, SignalKind::Offer);
        assert_eq!(signal.target_user_id, user("bob"));
        assert_eq!(Value::Object(signal.payload), json!({"sdp": "v=0..."}));
    }

    #[test]
    fn test_parse_signal_requires_target() {
        let err = ClientMessage::parse(r#"{"type":"candidate","candidate":{}}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidField("missing targetUserId".into())
        );
    }

    #[test]
    fn test_parse_voice_status_drops_unknown_fields() {
        let msg = ClientMessage::parse(
            r#"{"type":"updateVoiceStatus","updates":{"isSpeaking":true,"isAdmin":true}}"#,
        )
        .unwrap();

        let ClientMessage::UpdateVoiceStatus(updates) = msg else {
            panic!("expected voice status");
        };
        assert_eq!(
            updates,
            VoiceStatusUpdates {
                is_mic_active: None,
                is_speaking: Some(true),
            }
        );
    }

    #[test]
    fn test_parse_voice_status_rejects_wrong_type() {
        let err = ClientMessage::parse(
            r#"{"type":"updateVoiceStatus","updates":{"isMicActive":"yes"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(_)));
    }

    #[test]
    fn test_forwarded_signal_shape() {
        let mut payload = Map::new();
        payload.insert("sdp".into(), json!("v=0..."));
        let frame = ServerMessage::signal(SignalKind::Offer, user("alice"), payload)
            .to_frame()
            .unwrap();

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "offer", "fromUserId": "alice", "sdp": "v=0..."})
        );
    }

    #[test]
    fn test_room_joined_shape() {
        let msg = ServerMessage::RoomJoined {
            room_id: RoomId::parse("R1").unwrap(),
            users: vec![MemberInfo {
                user_id: user("alice"),
                is_mic_active: true,
                is_speaking: false,
                name: Some("Alice".into()),
                profile_image_url: None,
            }],
        };

        let value: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "roomJoined",
                "roomId": "R1",
                "users": [{"userId": "alice", "isMicActive": true, "isSpeaking": false, "name": "Alice"}]
            })
        );
    }

    #[test]
    fn test_voice_status_update_only_carries_changed_fields() {
        let msg = ServerMessage::VoiceStatusUpdate(VoiceStatusChange {
            user_id: user("alice"),
            is_mic_active: None,
            is_speaking: Some(true),
        });
        let value: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "voiceStatusUpdate", "userId": "alice", "isSpeaking": true})
        );
    }

    #[test]
    fn test_close_codes_are_distinct() {
        let reasons = [
            CloseReason::Normal,
            CloseReason::GoingAway,
            CloseReason::BinaryUnsupported,
            CloseReason::MessageTooLarge,
            CloseReason::AuthTimeout,
            CloseReason::AuthFailed,
            CloseReason::RateLimited,
        ];
        let mut codes: Vec<u16> = reasons.iter().map(CloseReason::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
        assert_eq!(CloseReason::RateLimited.code(), 4002);
    }
}
