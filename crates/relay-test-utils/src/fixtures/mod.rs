//! Deterministic credential fixtures.
//!
//! Provides reproducible Ed25519 keypairs and a builder for signed JWT
//! credentials, for tests that exercise `JwtAuthVerifier` end to end.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::Serialize;

/// Deterministic Ed25519 keypair.
///
/// The same seed always produces the same keypair.
#[derive(Debug, Clone)]
pub struct TestKeypair {
    public_key_bytes: Vec<u8>,
    private_key_pkcs8: Vec<u8>,
}

impl TestKeypair {
    /// Build the keypair for `seed`.
    ///
    /// # Panics
    ///
    /// Panics if ring rejects the derived seed (never for 32-byte seeds).
    #[must_use]
    pub fn new(seed: u8) -> Self {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[0] = seed;
        for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("Failed to create test keypair");

        Self {
            public_key_bytes: key_pair.public_key().as_ref().to_vec(),
            private_key_pkcs8: build_pkcs8_from_seed(&seed_bytes),
        }
    }

    /// Public key as a JWK `x` value, the format `RELAY_JWT_PUBLIC_KEY` takes.
    #[must_use]
    pub fn jwk_x(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.public_key_bytes)
    }

    /// Sign a credential for `subject` valid for one hour.
    #[must_use]
    pub fn sign_for(&self, subject: &str) -> String {
        TestTokenBuilder::new(subject).sign(self)
    }
}

/// Build PKCS#8 v1 document from Ed25519 seed.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
    iat: i64,
}

/// Builder for signed credentials with adjustable timestamps.
///
/// # Example
///
/// ```rust,ignore
/// let keypair = TestKeypair::new(1);
/// let expired = TestTokenBuilder::new("alice")
///     .expires_in_seconds(-60)
///     .sign(&keypair);
/// ```
#[derive(Debug, Clone)]
pub struct TestTokenBuilder {
    subject: String,
    expires_in_seconds: i64,
    issued_offset_seconds: i64,
}

impl TestTokenBuilder {
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            expires_in_seconds: 3600,
            issued_offset_seconds: 0,
        }
    }

    /// Expiry relative to now; negative values produce expired credentials.
    #[must_use]
    pub fn expires_in_seconds(mut self, seconds: i64) -> Self {
        self.expires_in_seconds = seconds;
        self
    }

    /// `iat` relative to now; positive values are in the future.
    #[must_use]
    pub fn issued_offset_seconds(mut self, seconds: i64) -> Self {
        self.issued_offset_seconds = seconds;
        self
    }

    /// Sign with `keypair` using EdDSA.
    ///
    /// # Panics
    ///
    /// Panics if signing fails.
    #[must_use]
    pub fn sign(&self, keypair: &TestKeypair) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: &self.subject,
            exp: now + self.expires_in_seconds,
            iat: now + self.issued_offset_seconds,
        };

        let encoding_key = EncodingKey::from_ed_der(&keypair.private_key_pkcs8);
        encode(&Header::new(Algorithm::EdDSA), &claims, &encoding_key)
            .expect("Failed to sign test credential")
    }
}
