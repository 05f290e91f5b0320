//! OpenSSH `authorized_keys` parsing.
//!
//! Each usable line yields the decoded public key blob. Options before the
//! key type are tolerated. Comments and blank lines are skipped, as are
//! lines whose key does not parse as an SSH public key.

use std::fs;
use std::io;
use std::path::Path;

use base64::Engine;
use subtle::{Choice, ConstantTimeEq};
use tracing::debug;

/// One accepted public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub algorithm: String,
    /// SSH wire encoding of the key.
    pub blob: Vec<u8>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeys {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let keys = Self::parse(&contents);
        debug!(count = keys.len(), "Loaded authorized keys from {:?}", path.as_ref());
        Ok(keys)
    }

    pub fn parse(contents: &str) -> Self {
        let keys = contents
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let parsed = parse_line(line);
                if parsed.is_none() {
                    debug!(line = index + 1, "Skipping malformed authorized_keys line");
                }
                parsed
            })
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Whether `blob` is one of the keys. Every key is compared.
    pub fn contains(&self, blob: &[u8]) -> bool {
        let mut found = Choice::from(0);
        for key in &self.keys {
            found |= key.blob.as_slice().ct_eq(blob);
        }
        found.into()
    }
}

/// Find `<type> <base64>` anywhere on the line, skipping leading options.
fn parse_line(line: &str) -> Option<AuthorizedKey> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    for (i, window) in tokens.windows(2).enumerate() {
        let (algorithm, encoded) = (window[0], window[1]);
        if !looks_like_key_type(algorithm) {
            continue;
        }
        let Ok(blob) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            continue;
        };
        if embedded_type(&blob) != Some(algorithm) {
            continue;
        }
        if let Err(e) = russh_keys::key::parse_public_key(&blob, None) {
            debug!(algorithm, "Rejecting unusable public key: {}", e);
            continue;
        }

        let comment = tokens.get(i + 2..).filter(|rest| !rest.is_empty()).map(|rest| rest.join(" "));
        return Some(AuthorizedKey {
            algorithm: algorithm.to_string(),
            blob,
            comment,
        });
    }
    None
}

fn looks_like_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

/// Key type string at the start of a wire blob.
fn embedded_type(blob: &[u8]) -> Option<&str> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}
