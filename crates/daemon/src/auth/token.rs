//! Self-verifying session tokens.
//!
//! A token is `id.timestamp.signature` where `signature` is the standard
//! base64 encoding of `HMAC-SHA256(secret, id || timestamp)`. Nothing is
//! stored server-side: validation recomputes the signature and checks the
//! age against the configured TTL.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated secret.
const RANDOM_SECRET_LENGTH: usize = 32;

#[derive(Clone)]
pub struct SessionTokens {
    mac: HmacSha256,
    ttl: Duration,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionTokens {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::InvalidSecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidSecret)?;
        Ok(Self { mac, ttl })
    }

    /// Tokens signed with a random per-process secret.
    pub fn random(ttl: Duration) -> Result<Self, AuthError> {
        let mut secret = [0u8; RANDOM_SECRET_LENGTH];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(&secret, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self) -> String {
        self.issue_at(unix_now())
    }

    pub fn issue_at(&self, timestamp: u64) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let timestamp = timestamp.to_string();
        let signature = self.sign(&id, &timestamp).finalize().into_bytes();
        format!(
            "{}.{}.{}",
            id,
            timestamp,
            base64::engine::general_purpose::STANDARD.encode(signature)
        )
    }

    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, unix_now())
    }

    /// Validate against an explicit clock. Fails closed on any defect.
    pub fn validate_at(&self, token: &str, now: u64) -> bool {
        let parts: Vec<&str> = token.split('.').collect();
        let [id, timestamp, signature] = parts.as_slice() else {
            return false;
        };
        if id.is_empty() {
            return false;
        }
        let Ok(issued) = timestamp.parse::<u64>() else {
            return false;
        };
        let Ok(signature) = base64::engine::general_purpose::STANDARD.decode(signature) else {
            return false;
        };

        if self.sign(id, timestamp).verify_slice(&signature).is_err() {
            return false;
        }

        now.saturating_sub(issued) <= self.ttl.as_secs()
    }

    fn sign(&self, id: &str, timestamp: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.update(timestamp.as_bytes());
        mac
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
