//! `RoomRegistryActor` - singleton directory of live rooms.
//!
//! The `RoomRegistryActor` is the top-level actor in the relay:
//!
//! - Singleton per process
//! - Maps room ids to `RoomActor` instances, spawning them on first join
//! - Never awaits a room actor from its message loop
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Room Instances
//!
//! Every spawned room gets a fresh epoch. A room that empties reports
//! `RoomClosed { epoch }`; the registry only forgets the room if the epoch
//! still matches, so a late close can never evict a newer instance. A join
//! that races a closing room sees `RoomClosed` and retries, naming the stale
//! epoch so the registry replaces it.
//!
//! # Graceful Shutdown
//!
//! On cancellation the registry:
//! 1. Sets `accepting_new = false`
//! 2. Cancels every room actor
//! 3. Waits (bounded) for each room task to finish

use crate::errors::RelayError;
use crate::store::ParticipantStore;

use super::messages::{JoinOutcome, JoiningMember, RegistryMessage, RegistryStatus, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Attempts made when a join keeps landing on closing room instances.
const JOIN_ATTEMPTS: usize = 3;

/// How often finished room tasks are reaped.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on waiting for a removed room task.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for each room task during shutdown.
const SHUTDOWN_ROOM_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with rooms. All methods
/// are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        settings: RoomSettings,
        store: Arc<dyn ParticipantStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            settings,
            store,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// Returns the room the member was admitted to.
    ///
    /// # Errors
    ///
    /// Whatever the room rejects the join with (`RoomFull`, `Conflict`,
    /// `Store`), or `Internal` if the registry is gone.
    pub async fn join(
        &self,
        room_id: RoomId,
        member: JoiningMember,
    ) -> Result<(RoomActorHandle, JoinOutcome), RelayError> {
        let mut stale_epoch = None;

        for attempt in 1..=JOIN_ATTEMPTS {
            let room = self.get_or_create_room(room_id.clone(), stale_epoch).await?;
            match room.join(member.clone()).await {
                Ok(outcome) => return Ok((room, outcome)),
                Err(RelayError::RoomClosed) => {
                    debug!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        epoch = room.epoch(),
                        attempt = attempt,
                        "Join landed on a closing room, retrying"
                    );
                    stale_epoch = Some(room.epoch());
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            target: "relay.actor.registry",
            room_id = %room_id,
            "Join retries exhausted"
        );
        Err(RelayError::Internal(
            "room closed repeatedly during join".to_string(),
        ))
    }

    async fn get_or_create_room(
        &self,
        room_id: RoomId,
        stale_epoch: Option<u64>,
    ) -> Result<RoomActorHandle, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                stale_epoch,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a live room without creating it.
    pub async fn get_room(&self, room_id: RoomId) -> Result<Option<RoomActorHandle>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Snapshot of a room, or `None` if it does not exist. A room still
    /// writing its first member's mirror record does not exist yet.
    pub async fn room_state(&self, room_id: RoomId) -> Result<Option<RoomState>, RelayError> {
        match self.get_room(room_id).await? {
            Some(room) => Ok(room
                .get_state()
                .await
                .ok()
                .filter(|state| !state.members.is_empty())),
            None => Ok(None),
        }
    }

    /// Get registry status.
    pub async fn status(&self) -> Result<RegistryStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry and every room (root token).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the registry is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    /// Handle to the room actor.
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    /// Message receiver.
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Own mailbox, handed to rooms for close notifications.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    /// Live rooms by ID.
    rooms: HashMap<RoomId, ManagedRoom>,
    /// Epoch for the next spawned room.
    next_epoch: u64,
    /// Whether the registry is creating new rooms.
    accepting_new: bool,
    settings: RoomSettings,
    store: Arc<dyn ParticipantStore>,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        receiver: mpsc::Receiver<RegistryMessage>,
        self_sender: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        settings: RoomSettings,
        store: Arc<dyn ParticipantStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            cancel_token,
            rooms: HashMap::new(),
            next_epoch: 1,
            accepting_new: true,
            settings,
            store,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "relay.actor.registry",
            capacity = self.settings.capacity,
            "RoomRegistryActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {
                    self.check_room_health().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message);
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                stale_epoch,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id, stale_epoch);
                let _ = respond_to.send(result);
            }

            RegistryMessage::RoomClosed { room_id, epoch } => {
                self.remove_room(&room_id, epoch);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&room_id)
                    .filter(|managed| !managed.task_handle.is_finished())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }
        }
    }

    fn get_or_create_room(
        &mut self,
        room_id: RoomId,
        stale_epoch: Option<u64>,
    ) -> Result<RoomActorHandle, RelayError> {
        if let Some(managed) = self.rooms.get(&room_id) {
            let stale = stale_epoch == Some(managed.handle.epoch())
                || managed.task_handle.is_finished();
            if !stale {
                return Ok(managed.handle.clone());
            }

            // The instance is closing; its RoomClosed may still be queued and
            // will be ignored on epoch mismatch.
            if let Some(old) = self.rooms.remove(&room_id) {
                debug!(
                    target: "relay.actor.registry",
                    room_id = %room_id,
                    epoch = old.handle.epoch(),
                    "Replacing closing room"
                );
                self.reap(room_id.clone(), old);
            }
        }

        if !self.accepting_new {
            return Err(RelayError::Internal("registry is shutting down".to_string()));
        }

        let Some(registry) = self.self_sender.upgrade() else {
            return Err(RelayError::Internal("registry mailbox closed".to_string()));
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            epoch,
            self.settings,
            Arc::clone(&self.store),
            registry,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );

        debug!(
            target: "relay.actor.registry",
            room_id = %room_id,
            epoch = epoch,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Forget a room if `epoch` still names the current instance.
    fn remove_room(&mut self, room_id: &RoomId, epoch: u64) {
        let current = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| managed.handle.epoch() == epoch);
        if !current {
            debug!(
                target: "relay.actor.registry",
                room_id = %room_id,
                epoch = epoch,
                "Ignoring close from a replaced room instance"
            );
            return;
        }

        if let Some(managed) = self.rooms.remove(room_id) {
            self.reap(room_id.clone(), managed);
            debug!(
                target: "relay.actor.registry",
                room_id = %room_id,
                epoch = epoch,
                total_rooms = self.rooms.len(),
                "Room removed"
            );
        }
    }

    /// Wait for a removed room's task in the background - never block the
    /// message loop on a room.
    fn reap(&self, room_id: RoomId, managed: ManagedRoom) {
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    if e.is_panic() {
                        metrics.record_panic(ActorType::Room);
                    }
                    warn!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task failed during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        "Room actor task cleanup timed out"
                    );
                    managed.handle.cancel();
                }
            }
        });
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            connection_count: self.metrics.connection_count(),
            accepting_new: self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "relay.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Already cancelled via the parent token, but be explicit
        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(SHUTDOWN_ROOM_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "relay.actor.registry",
            "Graceful shutdown complete"
        );
    }

    /// Reap room actors whose task has ended without a `RoomClosed`.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "relay.actor.registry",
                        room_id = %room_id,
                        "Room actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "relay.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - members lost their room"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::actors::messages::MemberProfile;
    use crate::store::{DisabledStore, ParticipantRecord, StoreError};
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use common::types::{ConnectionId, UserId};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};
    use tokio::sync::Notify;

    /// Holds every `add_participant` until `release` is notified.
    #[derive(Default)]
    struct GatedStore {
        release: Notify,
    }

    #[async_trait]
    impl ParticipantStore for GatedStore {
        async fn add_participant(
            &self,
            _room_id: &RoomId,
            _record: &ParticipantRecord,
        ) -> Result<(), StoreError> {
            self.release.notified().await;
            Ok(())
        }

        async fn update_mic_status(
            &self,
            _room_id: &RoomId,
            _user_id: &UserId,
            _is_mic_active: bool,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove_participant(
            &self,
            _room_id: &RoomId,
            _user_id: &UserId,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove_room(&self, _room_id: &RoomId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn registry(capacity: usize) -> (RoomRegistryHandle, Arc<ActorMetrics>) {
        let metrics = ActorMetrics::new();
        let handle = RoomRegistryHandle::new(
            RoomSettings {
                capacity,
                store_timeout: Duration::from_secs(1),
            },
            Arc::new(DisabledStore),
            Arc::clone(&metrics),
        );
        (handle, metrics)
    }

    fn member(user: &str, metrics: &Arc<ActorMetrics>) -> (JoiningMember, UnboundedReceiver<Message>) {
        let (sink, socket) = unbounded();
        let connection_id = ConnectionId::new();
        let (connection, _task) = ConnectionActor::spawn(
            connection_id,
            sink,
            16,
            CancellationToken::new(),
            Arc::clone(metrics),
        );
        (
            JoiningMember {
                user_id: UserId::parse(user).unwrap(),
                connection_id,
                connection,
                profile: MemberProfile::default(),
            },
            socket,
        )
    }

    fn room_id(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_join_creates_room() {
        let (registry, metrics) = registry(8);
        let (alice, _socket) = member("alice", &metrics);

        let (room, outcome) = registry.join(room_id("R1"), alice).await.unwrap();
        assert_eq!(outcome.member_count, 1);
        assert_eq!(room.room_id().as_str(), "R1");

        let status = registry.status().await.unwrap();
        assert_eq!(status.room_count, 1);
        assert!(status.accepting_new);

        let state = registry.room_state(room_id("R1")).await.unwrap().unwrap();
        assert_eq!(state.members.len(), 1);
        assert!(registry.room_state(room_id("R2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_then_leave_restores_empty_registry() {
        let (registry, metrics) = registry(8);
        let (alice, _socket) = member("alice", &metrics);
        let user_id = alice.user_id.clone();
        let connection_id = alice.connection_id;

        let (room, _) = registry.join(room_id("R1"), alice).await.unwrap();
        let outcome = room.leave(user_id, connection_id).await;
        assert!(outcome.room_closed);

        // RoomClosed is queued ahead of this request
        assert_eq!(registry.status().await.unwrap().room_count, 0);
        assert!(registry.get_room(room_id("R1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejoin_after_close_gets_new_instance() {
        let (registry, metrics) = registry(8);
        let (alice, _a) = member("alice", &metrics);
        let user_id = alice.user_id.clone();
        let connection_id = alice.connection_id;

        let (first, _) = registry.join(room_id("R1"), alice).await.unwrap();
        first.leave(user_id, connection_id).await;

        let (bob, _b) = member("bob", &metrics);
        let (second, _) = registry.join(room_id("R1"), bob).await.unwrap();
        assert!(second.epoch() > first.epoch());
    }

    #[tokio::test]
    async fn test_join_retries_past_closing_room() {
        let (registry, metrics) = registry(8);
        let (alice, _a) = member("alice", &metrics);

        let (first, _) = registry.join(room_id("R1"), alice).await.unwrap();
        // Room stops without telling the registry
        first.cancel();

        let (bob, _b) = member("bob", &metrics);
        let (second, outcome) = registry.join(room_id("R1"), bob).await.unwrap();
        assert_ne!(second.epoch(), first.epoch());
        assert_eq!(outcome.member_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_through_registry_respect_capacity() {
        let (registry, metrics) = registry(8);
        let members: Vec<_> = (0..12)
            .map(|i| member(&format!("user-{i}"), &metrics))
            .collect();

        let joins = members
            .iter()
            .map(|(m, _)| registry.join(room_id("R1"), m.clone()));
        let results = futures::future::join_all(joins).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 8);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RelayError::RoomFull(8))));
        assert_eq!(registry.status().await.unwrap().room_count, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let (registry, metrics) = registry(1);
        let (alice, _a) = member("alice", &metrics);
        let (bob, _b) = member("bob", &metrics);

        registry.join(room_id("R1"), alice).await.unwrap();
        registry.join(room_id("R2"), bob).await.unwrap();

        assert_eq!(registry.status().await.unwrap().room_count, 2);
    }

    #[tokio::test]
    async fn test_cancel_shuts_down_rooms() {
        let (registry, metrics) = registry(8);
        let (alice, _a) = member("alice", &metrics);
        let (room, _) = registry.join(room_id("R1"), alice).await.unwrap();

        registry.cancel();
        assert!(registry.is_cancelled());

        // Room token is a child of the registry's root token
        assert!(room.is_cancelled());

        // Registry drops its mailbox once shutdown completes
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.status().await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (bob, _b) = member("bob", &metrics);
        assert!(matches!(
            registry.join(room_id("R1"), bob).await,
            Err(RelayError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_child_token_follows_registry() {
        let (registry, _metrics) = registry(8);
        let child = registry.child_token();

        assert!(!child.is_cancelled());
        registry.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_room_admitting_first_member_has_no_state() {
        let metrics = ActorMetrics::new();
        let store = Arc::new(GatedStore::default());
        let registry = RoomRegistryHandle::new(
            RoomSettings {
                capacity: 8,
                store_timeout: Duration::from_secs(5),
            },
            Arc::clone(&store) as Arc<dyn ParticipantStore>,
            Arc::clone(&metrics),
        );
        let (alice, _socket) = member("alice", &metrics);

        let join = tokio::spawn({
            let registry = registry.clone();
            async move { registry.join(room_id("R1"), alice).await }
        });

        // Instance is registered while its first mirror write is pending
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.get_room(room_id("R1")).await.unwrap().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.status().await.unwrap().room_count, 1);
        assert!(registry.room_state(room_id("R1")).await.unwrap().is_none());

        store.release.notify_one();
        let (_room, outcome) = join.await.unwrap().unwrap();
        assert_eq!(outcome.member_count, 1);

        let state = registry.room_state(room_id("R1")).await.unwrap().unwrap();
        assert_eq!(state.members.len(), 1);
    }
}
