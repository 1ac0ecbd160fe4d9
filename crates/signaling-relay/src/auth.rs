//! Credential verification for room joins.
//!
//! The dispatcher only sees the [`AuthVerifier`] trait. Production uses
//! [`JwtAuthVerifier`]; tests swap in a mock.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only EdDSA (Ed25519) signatures are accepted
//! - `exp` is enforced; `iat` is checked with clock skew tolerance
//! - Every failure collapses into one generic error

use async_trait::async_trait;
use common::jwt::{
    check_token_size, decode_ed25519_public_key_jwk, validate_iat, UserClaims,
    ED25519_PUBLIC_KEY_LEN,
};
use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Identity established by a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
}

/// Credential verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential is malformed, expired, or signed by the wrong key.
    #[error("The credential is invalid or expired")]
    InvalidCredential,

    /// Verifier could not reach a decision (e.g., a backing service is down).
    #[error("Credential verification unavailable: {0}")]
    Unavailable(String),

    /// Verifier was built with an unusable key.
    #[error("Invalid verification key: {0}")]
    InvalidKey(String),
}

/// Verifies join credentials.
///
/// Must be safe under concurrent calls; verification may take arbitrarily long.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &SecretString) -> Result<VerifiedIdentity, AuthError>;
}

/// Verifies Ed25519-signed JWTs against a single configured public key.
pub struct JwtAuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    clock_skew: Duration,
}

impl fmt::Debug for JwtAuthVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthVerifier")
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl JwtAuthVerifier {
    /// Build a verifier from a JWK `x` value (base64url, 32-byte key).
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidKey` if the value does not decode to an
    /// Ed25519 public key.
    pub fn from_public_key_jwk(x_b64url: &str, clock_skew: Duration) -> Result<Self, AuthError> {
        let public_key_bytes = decode_ed25519_public_key_jwk(x_b64url)
            .map_err(|e| AuthError::InvalidKey(format!("not valid base64url: {e}")))?;

        if public_key_bytes.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(AuthError::InvalidKey(format!(
                "expected {ED25519_PUBLIC_KEY_LEN} bytes, got {}",
                public_key_bytes.len()
            )));
        }

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_ed_der(&public_key_bytes),
            validation,
            clock_skew,
        })
    }

    fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        check_token_size(token).map_err(|e| {
            tracing::debug!(target: "relay.auth", error = ?e, "Credential size check failed");
            AuthError::InvalidCredential
        })?;

        let token_data =
            decode::<UserClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
                tracing::debug!(target: "relay.auth", error = %e, "Credential verification failed");
                AuthError::InvalidCredential
            })?;
        let claims = token_data.claims;

        validate_iat(claims.iat, self.clock_skew).map_err(|e| {
            tracing::debug!(target: "relay.auth", error = ?e, "Credential iat validation failed");
            AuthError::InvalidCredential
        })?;

        let user_id = UserId::parse(claims.sub).map_err(|e| {
            tracing::debug!(target: "relay.auth", error = %e, "Credential subject rejected");
            AuthError::InvalidCredential
        })?;

        Ok(VerifiedIdentity { user_id })
    }
}

#[async_trait]
impl AuthVerifier for JwtAuthVerifier {
    #[instrument(skip_all, name = "relay.auth.verify")]
    async fn verify(&self, credential: &SecretString) -> Result<VerifiedIdentity, AuthError> {
        let result = self.verify_token(credential.expose_secret());
        if result.is_ok() {
            tracing::debug!(target: "relay.auth", "Credential verified");
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use serde::Serialize;

    /// Test keypair for signing credentials.
    struct TestKeypair {
        public_key_bytes: Vec<u8>,
        private_key_pkcs8: Vec<u8>,
    }

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
        iat: i64,
    }

    impl TestKeypair {
        fn new(seed: u8) -> Self {
            let mut seed_bytes = [0u8; 32];
            seed_bytes[0] = seed;
            for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
                #[allow(clippy::cast_possible_truncation)]
                let i = i as u8;
                *byte = seed.wrapping_mul(i).wrapping_add(i);
            }

            let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
                .expect("Failed to create test keypair");

            Self {
                public_key_bytes: key_pair.public_key().as_ref().to_vec(),
                private_key_pkcs8: build_pkcs8_from_seed(&seed_bytes),
            }
        }

        fn jwk_x(&self) -> String {
            URL_SAFE_NO_PAD.encode(&self.public_key_bytes)
        }

        fn sign(&self, claims: &TestClaims) -> SecretString {
            let encoding_key = EncodingKey::from_ed_der(&self.private_key_pkcs8);
            let token = encode(&Header::new(Algorithm::EdDSA), claims, &encoding_key)
                .expect("Failed to sign token");
            SecretString::from(token)
        }
    }

    /// Build PKCS#8 v1 document from Ed25519 seed.
    fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
        let mut pkcs8 = Vec::new();
        pkcs8.push(0x30);
        pkcs8.push(0x2e);
        pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
        pkcs8.push(0x30);
        pkcs8.push(0x05);
        pkcs8.extend_from_slice(&[0x06, 0x03, 0x2b, 0x65, 0x70]);
        pkcs8.push(0x04);
        pkcs8.push(0x22);
        pkcs8.push(0x04);
        pkcs8.push(0x20);
        pkcs8.extend_from_slice(seed);
        pkcs8
    }

    fn claims(sub: &str) -> TestClaims {
        let now = chrono::Utc::now().timestamp();
        TestClaims {
            sub: sub.to_string(),
            exp: now + 3600,
            iat: now,
        }
    }

    fn verifier(keypair: &TestKeypair) -> JwtAuthVerifier {
        JwtAuthVerifier::from_public_key_jwk(&keypair.jwk_x(), Duration::from_secs(300)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_credential_yields_subject() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);

        let identity = verifier.verify(&keypair.sign(&claims("alice"))).await.unwrap();
        assert_eq!(identity.user_id.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let signer = TestKeypair::new(1);
        let other = TestKeypair::new(2);
        let verifier = verifier(&other);

        let result = verifier.verify(&signer.sign(&claims("alice"))).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_expired_credential_rejected() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);
        let now = chrono::Utc::now().timestamp();

        let expired = TestClaims {
            sub: "alice".to_string(),
            exp: now - 3600,
            iat: now - 7200,
        };
        let result = verifier.verify(&keypair.sign(&expired)).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_future_iat_beyond_skew_rejected() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);
        let now = chrono::Utc::now().timestamp();

        let future = TestClaims {
            sub: "alice".to_string(),
            exp: now + 7200,
            iat: now + 3600,
        };
        let result = verifier.verify(&keypair.sign(&future)).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_empty_subject_rejected() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);

        let result = verifier.verify(&keypair.sign(&claims(""))).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_oversized_credential_rejected() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);

        let huge = SecretString::from("a".repeat(9000));
        let result = verifier.verify(&huge).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_garbage_credential_rejected() {
        let keypair = TestKeypair::new(1);
        let verifier = verifier(&keypair);

        for token in ["", "not-a-jwt", "a.b.c"] {
            let result = verifier.verify(&SecretString::from(token.to_string())).await;
            assert!(matches!(result, Err(AuthError::InvalidCredential)));
        }
    }

    #[test]
    fn test_invalid_public_key_rejected() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(
            JwtAuthVerifier::from_public_key_jwk(&short, Duration::from_secs(300)),
            Err(AuthError::InvalidKey(_))
        ));
        assert!(matches!(
            JwtAuthVerifier::from_public_key_jwk("!!!", Duration::from_secs(300)),
            Err(AuthError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_error_message_is_generic() {
        assert_eq!(
            AuthError::InvalidCredential.to_string(),
            "The credential is invalid or expired"
        );
    }
}
