//! Identifier types for rooms, users and connections.
//!
//! `RoomId` and `UserId` are validated on construction, so any value of these
//! types that exists in the process is known to be safe to use as a map key,
//! a log field, or part of a store key.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a room identifier.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Maximum length of a user identifier.
pub const MAX_USER_ID_LEN: usize = 128;

/// Identifier validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier exceeds {max} characters")]
    TooLong { max: usize },

    #[error("identifier contains a disallowed character")]
    InvalidCharacter,
}

/// Room identifier: 1-64 characters from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    ///
    /// # Errors
    ///
    /// Returns `IdError` if the value is empty, longer than
    /// [`MAX_ROOM_ID_LEN`], or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_ROOM_ID_LEN {
            return Err(IdError::TooLong {
                max: MAX_ROOM_ID_LEN,
            });
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(IdError::InvalidCharacter);
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User identifier as asserted by a verified credential.
///
/// 1-128 characters, no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap a user identifier.
    ///
    /// # Errors
    ///
    /// Returns `IdError` if the value is empty, longer than
    /// [`MAX_USER_ID_LEN`] characters, or contains whitespace/control characters.
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.chars().count() > MAX_USER_ID_LEN {
            return Err(IdError::TooLong {
                max: MAX_USER_ID_LEN,
            });
        }
        if value
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(IdError::InvalidCharacter);
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-generated identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
