//! Anti-forgery tokens for the login form.

use std::time::Duration;

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Cookie carrying the token alongside the form.
pub const CSRF_COOKIE: &str = "csrf_token";

/// Form field carrying the token.
pub const CSRF_FIELD: &str = "csrf_token";

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct CsrfGuard {
    ttl: Duration,
}

impl Default for CsrfGuard {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CsrfGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cookie lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 32 random bytes, hex encoded.
    pub fn issue_token(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Both values present, non-empty, and equal.
    pub fn verify(&self, form_value: Option<&str>, cookie_value: Option<&str>) -> bool {
        match (form_value, cookie_value) {
            (Some(form), Some(cookie)) if !form.is_empty() && !cookie.is_empty() => {
                form.as_bytes().ct_eq(cookie.as_bytes()).into()
            }
            _ => false,
        }
    }
}
