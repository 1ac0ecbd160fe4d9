//! Message types for actor communication.
//!
//! Request/response pairs carry a `oneshot::Sender` for the reply. Fire and
//! forget messages (outbound frames, room close notifications) carry none.

use crate::errors::RelayError;
use crate::protocol::{CloseReason, Frame, MemberInfo, SignalMessage, VoiceStatusUpdates};

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, RoomId, UserId};
use tokio::sync::oneshot;

// ============================================================================
// RoomRegistryActor Messages
// ============================================================================

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Look up the live room actor for `room_id`, spawning one if needed.
    ///
    /// `stale_epoch` names a room instance the caller already saw close;
    /// the registry replaces it instead of handing it out again.
    GetOrCreateRoom {
        room_id: RoomId,
        stale_epoch: Option<u64>,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RelayError>>,
    },

    /// A room actor emptied and is shutting down.
    RoomClosed { room_id: RoomId, epoch: u64 },

    /// Look up a room without creating it.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Get registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Number of live room instances, including one still admitting its
    /// first member.
    pub room_count: usize,
    /// Number of open connections.
    pub connection_count: usize,
    /// Whether new rooms are still being created.
    pub accepting_new: bool,
    /// Registry mailbox depth.
    pub mailbox_depth: usize,
}

// ============================================================================
// RoomActor Messages
// ============================================================================

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Admit a verified member.
    Join {
        member: JoiningMember,
        respond_to: oneshot::Sender<Result<JoinOutcome, RelayError>>,
    },

    /// Remove a member. Only takes effect if `connection_id` still owns the
    /// membership.
    Leave {
        user_id: UserId,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    /// Relay a signaling message to another member.
    Forward {
        from: UserId,
        connection_id: ConnectionId,
        signal: SignalMessage,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Apply a presence update from a member.
    UpdateVoiceStatus {
        user_id: UserId,
        connection_id: ConnectionId,
        updates: VoiceStatusUpdates,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Get a snapshot of the room.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Profile metadata supplied at join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberProfile {
    pub name: Option<String>,
    pub profile_image_url: Option<String>,
}

/// A member on its way into a room.
#[derive(Debug, Clone)]
pub struct JoiningMember {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Outbound mailbox of the member's connection.
    pub connection: ConnectionActorHandle,
    pub profile: MemberProfile,
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members in the room including the joiner.
    pub member_count: usize,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Whether a membership was actually removed.
    pub removed: bool,
    /// Whether the room emptied and shut down.
    pub room_closed: bool,
}

/// Room snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: RoomId,
    pub epoch: u64,
    /// Members in join order.
    pub members: Vec<MemberInfo>,
}

// ============================================================================
// ConnectionActor Messages
// ============================================================================

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write a serialized frame to the socket.
    Send { frame: Frame },

    /// Write a close frame and stop. Acknowledged once the close frame has
    /// been written (or the socket is already gone).
    Close {
        reason: CloseReason,
        respond_to: oneshot::Sender<()>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_leave_outcome_default_is_noop() {
        let outcome = LeaveOutcome::default();
        assert!(!outcome.removed);
        assert!(!outcome.room_closed);
    }

    #[test]
    fn test_member_profile_default_is_empty() {
        let profile = MemberProfile::default();
        assert!(profile.name.is_none());
        assert!(profile.profile_image_url.is_none());
    }
}
