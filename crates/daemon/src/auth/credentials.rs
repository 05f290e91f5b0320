//! Verification of the single configured principal.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use tracing::warn;

use super::authorized_keys::AuthorizedKeys;
use super::token::SessionTokens;
use crate::config::AuthConfig;

/// Checks passwords and public keys, and issues session tokens.
///
/// Username and password are compared as SHA-256 digests so that both
/// comparisons run over fixed-length input, and both always run.
#[derive(Debug, Clone)]
pub struct CredentialGate {
    username: String,
    username_digest: [u8; 32],
    password_digest: Option<[u8; 32]>,
    authorized_keys: AuthorizedKeys,
    tokens: SessionTokens,
}

impl CredentialGate {
    pub fn new(
        username: &str,
        password: Option<&str>,
        authorized_keys: AuthorizedKeys,
        tokens: SessionTokens,
    ) -> Self {
        Self {
            username: username.to_string(),
            username_digest: digest(username),
            password_digest: password.filter(|p| !p.is_empty()).map(digest),
            authorized_keys,
            tokens,
        }
    }

    /// Build from the `[auth]` section, loading the key file if configured.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let authorized_keys = match &config.authorized_keys {
            Some(path) => AuthorizedKeys::load(path).with_context(|| {
                format!("Failed to read authorized keys: {}", path.display())
            })?,
            None => AuthorizedKeys::default(),
        };

        let tokens = match config.session_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                SessionTokens::new(secret.as_bytes(), config.session_ttl())?
            }
            _ => {
                warn!("No session_secret configured; web sessions will not survive a restart");
                SessionTokens::random(config.session_ttl())?
            }
        };

        Ok(Self::new(
            &config.username,
            config.password.as_deref(),
            authorized_keys,
            tokens,
        ))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn accepts_password(&self) -> bool {
        self.password_digest.is_some()
    }

    pub fn accepts_public_keys(&self) -> bool {
        !self.authorized_keys.is_empty()
    }

    /// Constant-time check of a username and password.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let user_ok = self.user_matches(user);
        let password_ok = match &self.password_digest {
            Some(expected) => digest(password).ct_eq(expected),
            None => {
                // Same work as the configured case.
                let _ = digest(password).ct_eq(&[0u8; 32]);
                Choice::from(0)
            }
        };
        (user_ok & password_ok).into()
    }

    /// Check a public key blob offered by `user`.
    pub fn verify_public_key(&self, user: &str, blob: &[u8]) -> bool {
        let user_ok = self.user_matches(user);
        let key_ok = Choice::from(u8::from(self.authorized_keys.contains(blob)));
        (user_ok & key_ok).into()
    }

    pub fn issue_token(&self) -> String {
        self.tokens.issue()
    }

    pub fn validate_token(&self, token: &str) -> bool {
        self.tokens.validate(token)
    }

    pub fn tokens(&self) -> &SessionTokens {
        &self.tokens
    }

    fn user_matches(&self, user: &str) -> Choice {
        digest(user).ct_eq(&self.username_digest)
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
