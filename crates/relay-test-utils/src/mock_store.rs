//! In-memory participant store.
//!
//! Keeps the mirrored rooms in memory, logs every call in order, and can be
//! told to fail or stall specific operations.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::{MockParticipantStore, StoreCall};
//!
//! let store = MockParticipantStore::new();
//! store.fail_operation("add_participant");
//!
//! // ...a join through the relay now fails with a store error...
//! assert!(store.calls().contains(&StoreCall::AddParticipant {
//!     room_id: "room-1".into(),
//!     user_id: "alice".into(),
//! }));
//! ```

use async_trait::async_trait;
use common::types::{RoomId, UserId};
use signaling_relay::store::{ParticipantRecord, ParticipantStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One store call, in the order the relay made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    AddParticipant { room_id: String, user_id: String },
    UpdateMicStatus { room_id: String, user_id: String, is_mic_active: bool },
    RemoveParticipant { room_id: String, user_id: String },
    RemoveRoom { room_id: String },
}

#[derive(Debug, Default)]
struct MockStoreInner {
    rooms: HashMap<String, HashMap<String, ParticipantRecord>>,
    calls: Vec<StoreCall>,
    failing: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
}

/// Mock `ParticipantStore` for tests.
///
/// Clones share state, so a test can keep one clone and hand the other to
/// the relay.
#[derive(Debug, Clone, Default)]
pub struct MockParticipantStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockParticipantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail until [`Self::recover_operation`] is called.
    ///
    /// `operation` is the trait method name, e.g. `"add_participant"`.
    pub fn fail_operation(&self, operation: &'static str) {
        self.inner.lock().unwrap().failing.insert(operation);
    }

    pub fn recover_operation(&self, operation: &'static str) {
        self.inner.lock().unwrap().failing.remove(operation);
    }

    /// Stall `operation` for `delay` before it runs.
    pub fn delay_operation(&self, operation: &'static str, delay: Duration) {
        self.inner.lock().unwrap().delays.insert(operation, delay);
    }

    /// Every call so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Whether a room record exists.
    #[must_use]
    pub fn has_room(&self, room_id: &str) -> bool {
        self.inner.lock().unwrap().rooms.contains_key(room_id)
    }

    #[must_use]
    pub fn participant_count(&self, room_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn participant(&self, room_id: &str, user_id: &str) -> Option<ParticipantRecord> {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .and_then(|room| room.get(user_id))
            .cloned()
    }

    /// Log the call, then apply the configured delay and failure.
    async fn enter(&self, operation: &'static str, call: StoreCall) -> Result<(), StoreError> {
        let (delay, failing) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(call);
            (
                inner.delays.get(operation).copied(),
                inner.failing.contains(operation),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if failing {
            return Err(StoreError::Redis(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantStore for MockParticipantStore {
    async fn add_participant(
        &self,
        room_id: &RoomId,
        record: &ParticipantRecord,
    ) -> Result<(), StoreError> {
        self.enter(
            "add_participant",
            StoreCall::AddParticipant {
                room_id: room_id.to_string(),
                user_id: record.user_id.to_string(),
            },
        )
        .await?;

        self.inner
            .lock()
            .unwrap()
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(record.user_id.to_string(), record.clone());
        Ok(())
    }

    async fn update_mic_status(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        is_mic_active: bool,
    ) -> Result<(), StoreError> {
        self.enter(
            "update_mic_status",
            StoreCall::UpdateMicStatus {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                is_mic_active,
            },
        )
        .await?;

        if let Some(record) = self
            .inner
            .lock()
            .unwrap()
            .rooms
            .get_mut(room_id.as_str())
            .and_then(|room| room.get_mut(user_id.as_str()))
        {
            record.is_mic_active = is_mic_active;
        }
        Ok(())
    }

    async fn remove_participant(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        self.enter(
            "remove_participant",
            StoreCall::RemoveParticipant {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
        )
        .await?;

        if let Some(room) = self.inner.lock().unwrap().rooms.get_mut(room_id.as_str()) {
            room.remove(user_id.as_str());
        }
        Ok(())
    }

    async fn remove_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        self.enter(
            "remove_room",
            StoreCall::RemoveRoom {
                room_id: room_id.to_string(),
            },
        )
        .await?;

        self.inner.lock().unwrap().rooms.remove(room_id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(user_id: &str) -> ParticipantRecord {
        ParticipantRecord {
            user_id: UserId::parse(user_id).unwrap(),
            name: None,
            profile_image_url: None,
            is_mic_active: true,
            joined_at: Utc::now(),
        }
    }

    fn room() -> RoomId {
        RoomId::parse("room-1").unwrap()
    }

    #[tokio::test]
    async fn test_add_update_remove() {
        let store = MockParticipantStore::new();

        store.add_participant(&room(), &record("alice")).await.unwrap();
        store
            .update_mic_status(&room(), &UserId::parse("alice").unwrap(), false)
            .await
            .unwrap();
        assert!(!store.participant("room-1", "alice").unwrap().is_mic_active);

        store
            .remove_participant(&room(), &UserId::parse("alice").unwrap())
            .await
            .unwrap();
        assert_eq!(store.participant_count("room-1"), 0);
        assert!(store.has_room("room-1"));

        store.remove_room(&room()).await.unwrap();
        assert!(!store.has_room("room-1"));
        assert_eq!(store.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_injected_failure_is_logged_and_not_applied() {
        let store = MockParticipantStore::new();
        store.fail_operation("add_participant");

        let result = store.add_participant(&room(), &record("alice")).await;
        assert!(matches!(result, Err(StoreError::Redis(_))));
        assert!(!store.has_room("room-1"));
        assert_eq!(
            store.calls(),
            vec![StoreCall::AddParticipant {
                room_id: "room-1".to_string(),
                user_id: "alice".to_string(),
            }]
        );

        store.recover_operation("add_participant");
        store.add_participant(&room(), &record("alice")).await.unwrap();
        assert_eq!(store.participant_count("room-1"), 1);
    }
}
