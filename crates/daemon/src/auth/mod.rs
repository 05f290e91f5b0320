//! Authentication primitives shared by both front doors.
//!
//! - [`CredentialGate`]: constant-time password and public key checks,
//!   signed session tokens
//! - [`CsrfGuard`]: login form anti-forgery tokens
//! - [`RateLimiter`]: per-source attempt throttling
//! - [`AuthorizedKeys`]: OpenSSH `authorized_keys` parsing

pub mod authorized_keys;
pub mod credentials;
pub mod csrf;
pub mod rate_limit;
pub mod token;

use thiserror::Error;

pub use authorized_keys::{AuthorizedKey, AuthorizedKeys};
pub use credentials::CredentialGate;
pub use csrf::{CsrfGuard, CSRF_COOKIE, CSRF_FIELD};
pub use rate_limit::{AttemptRecord, RateLimiter};
pub use token::SessionTokens;

/// Generic text shown for any rejected login.
pub const LOGIN_FAILED: &str = "Invalid username or password.";

/// Text shown when a source is throttled.
pub const TOO_MANY_ATTEMPTS: &str = "Too many attempts. Please try again later.";

/// Authentication failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("CSRF token mismatch")]
    CsrfMismatch,

    #[error("too many attempts")]
    RateLimited,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("session secret must not be empty")]
    InvalidSecret,
}

impl AuthError {
    /// Text shown to the client. Credential and CSRF failures are
    /// indistinguishable.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::RateLimited => TOO_MANY_ATTEMPTS,
            _ => LOGIN_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_do_not_distinguish_failures() {
        assert_eq!(
            AuthError::AuthenticationFailed.user_message(),
            AuthError::CsrfMismatch.user_message()
        );
        assert!(AuthError::RateLimited
            .user_message()
            .to_lowercase()
            .contains("too many attempts"));
    }
}
