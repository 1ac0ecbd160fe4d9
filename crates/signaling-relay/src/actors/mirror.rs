//! `MirrorWriter` - ordered participant store writes for one room.
//!
//! The room actor never awaits a store call for a leave or a presence
//! change: it queues the write here and moves on to its next message. The
//! writer applies one room's writes one at a time, in the order they were
//! queued, so a rejoin's `add_participant` is never overtaken by the
//! `remove_participant` queued before it.
//!
//! Two writes report back:
//! - `add_participant`, because a failed mirror write rejects the join
//! - `remove_room`, acknowledged only after every earlier write has run, so
//!   a closing room can hand off to its successor with a settled mirror

use crate::store::{timed, ParticipantRecord, ParticipantStore, StoreError};

use common::types::{RoomId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Queued writes per room before best-effort writes are shed.
const MIRROR_CHANNEL_BUFFER: usize = 256;

enum MirrorOp {
    Add {
        record: ParticipantRecord,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    UpdateMic {
        user_id: UserId,
        is_mic_active: bool,
    },
    Remove {
        user_id: UserId,
    },
    RemoveRoom {
        respond_to: oneshot::Sender<()>,
    },
}

impl MirrorOp {
    const fn operation(&self) -> &'static str {
        match self {
            MirrorOp::Add { .. } => "add_participant",
            MirrorOp::UpdateMic { .. } => "update_mic_status",
            MirrorOp::Remove { .. } => "remove_participant",
            MirrorOp::RemoveRoom { .. } => "remove_room",
        }
    }
}

/// Handle to a room's `MirrorWriter`. Dropping every handle stops the writer
/// once its queue is empty.
#[derive(Clone, Debug)]
pub struct MirrorHandle {
    sender: mpsc::Sender<MirrorOp>,
    room_id: RoomId,
}

impl MirrorHandle {
    /// Queue a participant record and wait for the store's answer.
    ///
    /// # Errors
    ///
    /// The store's error (including `Timeout`), or `WriterStopped` if the
    /// writer is gone.
    pub async fn add_participant(&self, record: ParticipantRecord) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MirrorOp::Add {
                record,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::WriterStopped)?;

        rx.await.map_err(|_| StoreError::WriterStopped)?
    }

    /// Queue a microphone flag update without waiting.
    pub fn update_mic_status(&self, user_id: UserId, is_mic_active: bool) {
        self.enqueue(MirrorOp::UpdateMic {
            user_id,
            is_mic_active,
        });
    }

    /// Queue a participant removal without waiting.
    pub fn remove_participant(&self, user_id: UserId) {
        self.enqueue(MirrorOp::Remove { user_id });
    }

    /// Queue the room record's removal and wait until it, and every write
    /// queued before it, has run. Failures are already logged by the writer.
    pub async fn remove_room(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(MirrorOp::RemoveRoom { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    fn enqueue(&self, op: MirrorOp) {
        let operation = op.operation();
        match self.sender.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "relay.store",
                    room_id = %self.room_id,
                    operation = operation,
                    "Mirror queue full, write dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "relay.store",
                    room_id = %self.room_id,
                    operation = operation,
                    "Mirror writer stopped, write dropped"
                );
            }
        }
    }
}

/// Applies one room's store writes in order.
pub struct MirrorWriter {
    room_id: RoomId,
    receiver: mpsc::Receiver<MirrorOp>,
    store: Arc<dyn ParticipantStore>,
    timeout: Duration,
}

impl MirrorWriter {
    /// Spawn the writer for `room_id`. Each write is bounded by `timeout`.
    pub fn spawn(
        room_id: RoomId,
        store: Arc<dyn ParticipantStore>,
        timeout: Duration,
    ) -> (MirrorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MIRROR_CHANNEL_BUFFER);

        let writer = Self {
            room_id: room_id.clone(),
            receiver,
            store,
            timeout,
        };
        let task_handle = tokio::spawn(writer.run());

        (MirrorHandle { sender, room_id }, task_handle)
    }

    #[instrument(skip_all, name = "relay.actor.mirror", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        while let Some(op) = self.receiver.recv().await {
            self.apply(op).await;
        }

        debug!(
            target: "relay.store",
            room_id = %self.room_id,
            "MirrorWriter stopped"
        );
    }

    async fn apply(&self, op: MirrorOp) {
        let operation = op.operation();
        match op {
            MirrorOp::Add { record, respond_to } => {
                let result = timed(
                    operation,
                    self.timeout,
                    self.store.add_participant(&self.room_id, &record),
                )
                .await;
                let _ = respond_to.send(result);
            }

            MirrorOp::UpdateMic {
                user_id,
                is_mic_active,
            } => {
                let _ = timed(
                    operation,
                    self.timeout,
                    self.store
                        .update_mic_status(&self.room_id, &user_id, is_mic_active),
                )
                .await;
            }

            MirrorOp::Remove { user_id } => {
                let _ = timed(
                    operation,
                    self.timeout,
                    self.store.remove_participant(&self.room_id, &user_id),
                )
                .await;
            }

            MirrorOp::RemoveRoom { respond_to } => {
                let _ = timed(
                    operation,
                    self.timeout,
                    self.store.remove_room(&self.room_id),
                )
                .await;
                let _ = respond_to.send(());
            }
        }
    }
}
