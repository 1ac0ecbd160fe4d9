//! Scriptable credential verifier.
//!
//! Credentials of the form `user:<id>` verify as `<id>`; anything else is
//! rejected as invalid.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::MockAuthVerifier;
//!
//! let verifier = MockAuthVerifier::new().with_delay(Duration::from_millis(50));
//! let identity = verifier.verify(&SecretString::from("user:alice")).await?;
//! assert_eq!(identity.user_id.as_str(), "alice");
//! ```

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use signaling_relay::auth::{AuthError, AuthVerifier, VerifiedIdentity};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of credentials the mock accepts.
pub const CREDENTIAL_PREFIX: &str = "user:";

/// Mock `AuthVerifier` for tests.
///
/// Clones share the call counter and the unavailable switch.
#[derive(Debug, Clone, Default)]
pub struct MockAuthVerifier {
    delay: Option<Duration>,
    unavailable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockAuthVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every verification (simulates a slow verifier).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every verification with `AuthError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of verifications started.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Credential that verifies as `user_id`.
    #[must_use]
    pub fn credential_for(user_id: &str) -> String {
        format!("{CREDENTIAL_PREFIX}{user_id}")
    }
}

#[async_trait]
impl AuthVerifier for MockAuthVerifier {
    async fn verify(&self, credential: &SecretString) -> Result<VerifiedIdentity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("mock verifier unavailable".to_string()));
        }

        let user_id = credential
            .expose_secret()
            .strip_prefix(CREDENTIAL_PREFIX)
            .ok_or(AuthError::InvalidCredential)?;

        let user_id = UserId::parse(user_id).map_err(|_| AuthError::InvalidCredential)?;
        Ok(VerifiedIdentity { user_id })
    }
}
