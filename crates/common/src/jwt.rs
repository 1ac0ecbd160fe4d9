//! JWT helpers for join credentials.
//!
//! - Size limit checked before any parsing
//! - Clock skew constants for `iat` validation
//! - `UserClaims`, the claim set a join credential carries
//! - Ed25519 public key decoding from the JWK `x` form
//!
//! Signature verification itself lives with the verifier that owns the key;
//! this module only holds the pieces that do not depend on a key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before base64 decoding or signature
/// verification. Typical user tokens are 200-500 bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default tolerance for `iat` values in the future (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound on the configurable clock skew (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// Length of a raw Ed25519 public key.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Errors from key-independent JWT checks.
///
/// Messages are deliberately identical so callers can surface them without
/// revealing which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

/// Claims carried by a join credential.
///
/// `sub` is the user identity; it is redacted in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user identifier).
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

/// Reject tokens over [`MAX_JWT_SIZE_BYTES`].
///
/// # Errors
///
/// Returns `JwtValidationError::TokenTooLarge` when the token is oversized.
pub fn check_token_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Validate the `iat` (issued-at) claim against the wall clock.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if `iat` is more than
/// `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// `iat` validation against an explicit `now`, for boundary tests.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded by MAX_CLOCK_SKEW, well within i64
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Decode an Ed25519 public key from the JWK `x` field (base64url, no padding).
///
/// # Errors
///
/// Returns `base64::DecodeError` if the value is not valid base64url.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(x_b64url.trim())
}
