//! Participant mirror.
//!
//! Room membership is mirrored to an external store so other services can
//! read who is in a room. The relay never reads it back: the room actors
//! are the source of truth. Only a failed `add_participant` has a visible
//! effect (the join fails); every other failure is logged and swallowed by
//! the caller.
//!
//! Every write is bounded by [`timed`], which applies the configured timeout
//! and records latency and error metrics per operation.

mod lua_scripts;
mod redis;

pub use self::redis::RedisParticipantStore;

use crate::observability::metrics::record_store_operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Participant store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend command failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Operation did not complete within the store timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The room's mirror writer has stopped.
    #[error("Store writer stopped")]
    WriterStopped,
}

/// Mirrored participant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    pub is_mic_active: bool,
    pub joined_at: DateTime<Utc>,
}

/// External mirror of room membership.
///
/// Implementations must be safe under concurrent calls from many room actors.
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Record a participant, creating the room record on first join.
    async fn add_participant(
        &self,
        room_id: &RoomId,
        record: &ParticipantRecord,
    ) -> Result<(), StoreError>;

    /// Update a participant's microphone flag.
    async fn update_mic_status(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        is_mic_active: bool,
    ) -> Result<(), StoreError>;

    /// Remove a participant.
    async fn remove_participant(&self, room_id: &RoomId, user_id: &UserId)
        -> Result<(), StoreError>;

    /// Remove the room record and any remaining participants.
    async fn remove_room(&self, room_id: &RoomId) -> Result<(), StoreError>;
}

/// No-op store used when `REDIS_URL` is unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

#[async_trait]
impl ParticipantStore for DisabledStore {
    async fn add_participant(
        &self,
        _room_id: &RoomId,
        _record: &ParticipantRecord,
    ) -> Result<(), StoreError> {
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

/// Run a store operation under `timeout`, recording latency and errors.
///
/// # Errors
///
/// Returns the operation's error, or `StoreError::Timeout` if it did not
/// finish in time.
pub async fn timed<F>(operation: &'static str, timeout: Duration, fut: F) -> Result<(), StoreError>
where
    F: Future<Output = Result<(), StoreError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    };
    record_store_operation(operation, start.elapsed(), result.is_ok());

    if let Err(ref e) = result {
        warn!(
            target: "relay.store",
            operation = operation,
            error = %e,
            "Participant store operation failed"
        );
    }

    result
}
