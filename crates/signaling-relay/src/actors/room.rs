//! `RoomActor` - single writer for one room.
//!
//! Each `RoomActor`:
//! - Owns the room's member map; no other task reads or writes it
//! - Serializes join, leave, forward and presence updates through its mailbox
//! - Fans out notifications with non-blocking sends to member connections
//! - Mirrors membership through its [`MirrorWriter`]; only the join's write
//!   and the closing room's cleanup are awaited
//!
//! # Lifecycle
//!
//! 1. Spawned by the registry on the first join for a room id
//! 2. Admits that first member once its mirror write succeeds; until then
//!    the instance is registered but memberless, so it counts toward
//!    `RegistryStatus::room_count` while `room_state` reports no room
//! 3. Runs while the room has members
//! 4. When the last member leaves (or the first join fails), reports
//!    `RoomClosed` to the registry and exits; requests still queued are
//!    answered with `RoomClosed` so callers can retry on a fresh instance

use crate::errors::RelayError;
use crate::protocol::{
    MemberInfo, ServerMessage, SignalMessage, VoiceStatusChange, VoiceStatusUpdates,
};
use crate::store::{ParticipantRecord, ParticipantStore};

use super::connection::ConnectionActorHandle;
use super::messages::{
    JoinOutcome, JoiningMember, LeaveOutcome, RegistryMessage, RoomMessage, RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::mirror::{MirrorHandle, MirrorWriter};

use chrono::Utc;
use common::types::{ConnectionId, RoomId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// A room that never admits its first member shuts down after this long.
const EMPTY_ROOM_GRACE: Duration = Duration::from_secs(30);

/// Per-room tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    /// Maximum number of members.
    pub capacity: usize,
    /// Bound on each participant store write.
    pub store_timeout: Duration,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    epoch: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Registry-assigned instance number, unique per process.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Admit a verified member.
    ///
    /// # Errors
    ///
    /// `RoomFull`, `Conflict` (identity already present), `Store` (mirror
    /// write failed), or `RoomClosed` if this instance shut down first.
    pub async fn join(&self, member: JoiningMember) -> Result<JoinOutcome, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                member,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::RoomClosed)?;

        rx.await.map_err(|_| RelayError::RoomClosed)?
    }

    /// Remove `user_id` if `connection_id` still owns the membership.
    ///
    /// Never fails: a room that is already gone has no member to remove.
    pub async fn leave(&self, user_id: UserId, connection_id: ConnectionId) -> LeaveOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoomMessage::Leave {
                user_id,
                connection_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return LeaveOutcome::default();
        }

        rx.await.unwrap_or_default()
    }

    /// Relay a signaling message from a member to another member.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` if the sender is no longer a member, `PeerUnreachable`
    /// if the target is absent or its mailbox is full.
    pub async fn forward(
        &self,
        from: UserId,
        connection_id: ConnectionId,
        signal: SignalMessage,
    ) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Forward {
                from,
                connection_id,
                signal,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::NotAuthorized)?;

        rx.await.map_err(|_| RelayError::NotAuthorized)?
    }

    /// Apply a member's presence update.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` if the sender is no longer a member.
    pub async fn update_voice_status(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        updates: VoiceStatusUpdates,
    ) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::UpdateVoiceStatus {
                user_id,
                connection_id,
                updates,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::NotAuthorized)?;

        rx.await.map_err(|_| RelayError::NotAuthorized)?
    }

    /// Snapshot of the room's members.
    pub async fn get_state(&self) -> Result<RoomState, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A current member.
struct Member {
    info: MemberInfo,
    connection: ConnectionActorHandle,
    /// Join order within this room instance.
    seq: u64,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    epoch: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Registry mailbox for close notifications.
    registry: mpsc::Sender<RegistryMessage>,
    /// Ordered store writes for this room.
    mirror: MirrorHandle,
    settings: RoomSettings,
    members: HashMap<UserId, Member>,
    next_seq: u64,
    /// Whether this room has counted toward the active rooms gauge.
    counted: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        epoch: u64,
        settings: RoomSettings,
        store: Arc<dyn ParticipantStore>,
        registry: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        // The writer exits once this actor drops its handle and the queue drains
        let (mirror, _) = MirrorWriter::spawn(room_id.clone(), store, settings.store_timeout);

        let actor = Self {
            room_id: room_id.clone(),
            epoch,
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            mirror,
            settings,
            members: HashMap::new(),
            next_seq: 0,
            counted: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, format!("{room_id}#{epoch}")),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            epoch,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "relay.actor.room",
        fields(room_id = %self.room_id, epoch = self.epoch)
    )]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            "RoomActor started"
        );

        let idle = tokio::time::sleep(EMPTY_ROOM_GRACE);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.shutdown_cleanup().await;
                    break;
                }

                () = &mut idle, if self.members.is_empty() => {
                    debug!(
                        target: "relay.actor.room",
                        room_id = %self.room_id,
                        "Room never admitted a member, closing"
                    );
                    self.notify_closed().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.metrics.record_message_processed();
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.drain_mailbox();

        if self.counted {
            self.metrics.room_removed();
        }

        info!(
            target: "relay.actor.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            members_remaining = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the room closed.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join { member, respond_to } => {
                let result = self.handle_join(member).await;
                let closing = result.is_err() && self.members.is_empty();
                if closing {
                    self.notify_closed().await;
                }
                let _ = respond_to.send(result);
                closing
            }

            RoomMessage::Leave {
                user_id,
                connection_id,
                respond_to,
            } => self.handle_leave(user_id, connection_id, respond_to).await,

            RoomMessage::Forward {
                from,
                connection_id,
                signal,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_forward(&from, connection_id, signal));
                false
            }

            RoomMessage::UpdateVoiceStatus {
                user_id,
                connection_id,
                updates,
                respond_to,
            } => {
                self.handle_update_voice_status(user_id, connection_id, updates, respond_to);
                false
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(RoomState {
                    room_id: self.room_id.clone(),
                    epoch: self.epoch,
                    members: self.member_list(),
                });
                false
            }
        }
    }

    /// Admit a member: capacity and identity checks, mirror write, then
    /// in-memory insert and notifications.
    async fn handle_join(&mut self, member: JoiningMember) -> Result<JoinOutcome, RelayError> {
        if self.members.contains_key(&member.user_id) {
            debug!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                user_id = %member.user_id,
                "Join rejected: identity already present"
            );
            return Err(RelayError::Conflict("User already in room".to_string()));
        }

        if self.members.len() >= self.settings.capacity {
            debug!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                capacity = self.settings.capacity,
                "Join rejected: room full"
            );
            return Err(RelayError::RoomFull(self.settings.capacity));
        }

        let JoiningMember {
            user_id,
            connection_id,
            connection,
            profile,
        } = member;

        let record = ParticipantRecord {
            user_id: user_id.clone(),
            name: profile.name.clone(),
            profile_image_url: profile.profile_image_url.clone(),
            is_mic_active: true,
            joined_at: Utc::now(),
        };
        self.mirror.add_participant(record).await?;

        let info = MemberInfo {
            user_id: user_id.clone(),
            is_mic_active: true,
            is_speaking: false,
            name: profile.name,
            profile_image_url: profile.profile_image_url,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(
            user_id.clone(),
            Member {
                info: info.clone(),
                connection: connection.clone(),
                seq,
            },
        );
        if !self.counted {
            self.counted = true;
            self.metrics.room_created();
        }

        let joined = ServerMessage::RoomJoined {
            room_id: self.room_id.clone(),
            users: self.member_list(),
        };
        if let Err(e) = connection.send_message(&joined) {
            warn!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                connection_id = %connection_id,
                error = %e,
                "Failed to deliver roomJoined"
            );
        }
        self.broadcast(&ServerMessage::UserJoined(info), Some(&user_id));

        info!(
            target: "relay.actor.room",
            room_id = %self.room_id,
            user_id = %user_id,
            connection_id = %connection_id,
            member_count = self.members.len(),
            "Member joined"
        );

        Ok(JoinOutcome {
            member_count: self.members.len(),
        })
    }

    /// Remove a member. Returns true if the room closed.
    async fn handle_leave(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<LeaveOutcome>,
    ) -> bool {
        if !self.is_current_member(&user_id, connection_id) {
            let _ = respond_to.send(LeaveOutcome::default());
            return false;
        }

        self.members.remove(&user_id);
        self.broadcast(
            &ServerMessage::UserLeft {
                user_id: user_id.clone(),
            },
            None,
        );

        info!(
            target: "relay.actor.room",
            room_id = %self.room_id,
            user_id = %user_id,
            connection_id = %connection_id,
            member_count = self.members.len(),
            "Member left"
        );

        self.mirror.remove_participant(user_id);

        let room_closed = self.members.is_empty();
        if !room_closed {
            let _ = respond_to.send(LeaveOutcome {
                removed: true,
                room_closed,
            });
            return false;
        }

        // Mirror cleanup settles before the registry drops this instance, so
        // a successor room cannot have its fresh record deleted.
        self.mirror.remove_room().await;
        self.notify_closed().await;
        let _ = respond_to.send(LeaveOutcome {
            removed: true,
            room_closed,
        });
        true
    }

    fn handle_forward(
        &self,
        from: &UserId,
        connection_id: ConnectionId,
        signal: SignalMessage,
    ) -> Result<(), RelayError> {
        if !self.is_current_member(from, connection_id) {
            return Err(RelayError::NotAuthorized);
        }

        let Some(target) = self.members.get(&signal.target_user_id) else {
            debug!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                kind = signal.kind.as_str(),
                "Signal target not in room"
            );
            return Err(RelayError::PeerUnreachable);
        };

        let message = ServerMessage::signal(signal.kind, from.clone(), signal.payload);
        target.connection.send_message(&message).map_err(|e| {
            debug!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                kind = signal.kind.as_str(),
                error = %e,
                "Signal delivery failed"
            );
            RelayError::PeerUnreachable
        })
    }

    fn handle_update_voice_status(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
        updates: VoiceStatusUpdates,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    ) {
        if !self.is_current_member(&user_id, connection_id) {
            let _ = respond_to.send(Err(RelayError::NotAuthorized));
            return;
        }
        if updates.is_empty() {
            let _ = respond_to.send(Ok(()));
            return;
        }

        let Some(member) = self.members.get_mut(&user_id) else {
            let _ = respond_to.send(Err(RelayError::NotAuthorized));
            return;
        };

        let mic_changed = updates
            .is_mic_active
            .filter(|active| *active != member.info.is_mic_active);
        if let Some(active) = updates.is_mic_active {
            member.info.is_mic_active = active;
        }
        if let Some(speaking) = updates.is_speaking {
            member.info.is_speaking = speaking;
        }

        self.broadcast(
            &ServerMessage::VoiceStatusUpdate(VoiceStatusChange {
                user_id: user_id.clone(),
                is_mic_active: updates.is_mic_active,
                is_speaking: updates.is_speaking,
            }),
            Some(&user_id),
        );
        let _ = respond_to.send(Ok(()));

        // isSpeaking is runtime-only; only the mic flag is mirrored
        if let Some(active) = mic_changed {
            self.mirror.update_mic_status(user_id, active);
        }
    }

    fn is_current_member(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        self.members
            .get(user_id)
            .is_some_and(|m| m.connection.connection_id() == connection_id)
    }

    /// Members in join order.
    fn member_list(&self) -> Vec<MemberInfo> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.seq);
        members.into_iter().map(|m| m.info.clone()).collect()
    }

    /// Best-effort fan-out. Returns the number of members the frame was
    /// queued for.
    fn broadcast(&self, message: &ServerMessage, exclude: Option<&UserId>) -> usize {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    target: "relay.actor.room",
                    room_id = %self.room_id,
                    message_type = message.message_type(),
                    error = %e,
                    "Failed to encode broadcast"
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for (user_id, member) in &self.members {
            if exclude == Some(user_id) {
                continue;
            }
            match member.connection.try_send_frame(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        target: "relay.actor.room",
                        room_id = %self.room_id,
                        user_id = %user_id,
                        message_type = message.message_type(),
                        error = %e,
                        "Broadcast delivery skipped"
                    );
                }
            }
        }
        delivered
    }

    /// Tell the registry this instance is going away.
    async fn notify_closed(&self) {
        let message = RegistryMessage::RoomClosed {
            room_id: self.room_id.clone(),
            epoch: self.epoch,
        };
        if self.registry.send(message).await.is_err() {
            debug!(
                target: "relay.actor.room",
                room_id = %self.room_id,
                "Registry gone, skipping close notification"
            );
        }
    }

    /// Cancellation with members still present: drop the mirrored room.
    async fn shutdown_cleanup(&mut self) {
        if self.members.is_empty() {
            return;
        }
        info!(
            target: "relay.actor.room",
            room_id = %self.room_id,
            member_count = self.members.len(),
            "Room cancelled with members present"
        );
        self.mirror.remove_room().await;
    }

    /// Answer every request still queued after the loop exits.
    fn drain_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                RoomMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(RelayError::RoomClosed));
                }
                RoomMessage::Leave { respond_to, .. } => {
                    let _ = respond_to.send(LeaveOutcome::default());
                }
                RoomMessage::Forward { respond_to, .. }
                | RoomMessage::UpdateVoiceStatus { respond_to, .. } => {
                    let _ = respond_to.send(Err(RelayError::NotAuthorized));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(RoomState {
                        room_id: self.room_id.clone(),
                        epoch: self.epoch,
                        members: Vec::new(),
                    });
                }
            }
        }
    }
}
