//! Persistent server host key.
//!
//! The SFTP door proves its identity with an Ed25519 key stored as the raw
//! 32-byte secret. A missing or unreadable key file is replaced by a freshly
//! generated key; failing to write it is logged and otherwise ignored, so
//! the process can still serve with an in-memory key.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Length of a persisted key.
pub const SECRET_KEY_LENGTH: usize = 32;

const KEY_TYPE: &str = "ssh-ed25519";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to persist host key to {path}: {source}")]
    KeyPersistenceFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The server's long-lived signing key.
#[derive(Clone)]
pub struct HostIdentity {
    signing_key: SigningKey,
}

impl fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl HostIdentity {
    /// Generate a new in-memory identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load the key at `path`, or generate and persist a new one.
    ///
    /// Never fails: read or parse problems lead to a new key, and a write
    /// failure leaves the new key usable for this process only.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        match Self::load(path) {
            Ok(identity) => {
                info!(fingerprint = %identity.fingerprint(), "Loaded host key from {:?}", path);
                return identity;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No host key at {:?}, generating one", path);
            }
            Err(e) => {
                warn!(error = %e, "Host key at {:?} is unusable, generating a new one", path);
            }
        }

        let identity = Self::generate();
        match identity.persist(path) {
            Ok(()) => info!(fingerprint = %identity.fingerprint(), "Saved new host key to {:?}", path),
            Err(e) => warn!(error = %e, "Continuing with an unsaved host key"),
        }
        identity
    }

    fn load(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let secret: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected {} bytes, got {}",
                    SECRET_KEY_LENGTH,
                    bytes.len()
                ),
            )
        })?;
        Ok(Self::from_secret_key_bytes(&secret))
    }

    /// Write the secret with owner-only permissions.
    pub fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let wrap = |source: io::Error| IdentityError::KeyPersistenceFailure {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(wrap)?;
        file.write_all(&self.signing_key.to_bytes()).map_err(wrap)?;

        // `mode` only applies on creation.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(wrap)?;
        }
        Ok(())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// SSH wire encoding of the public key.
    pub fn public_key_blob(&self) -> Vec<u8> {
        let key = self.public_key_bytes();
        let mut blob = Vec::with_capacity(4 + KEY_TYPE.len() + 4 + key.len());
        blob.extend_from_slice(&(KEY_TYPE.len() as u32).to_be_bytes());
        blob.extend_from_slice(KEY_TYPE.as_bytes());
        blob.extend_from_slice(&(key.len() as u32).to_be_bytes());
        blob.extend_from_slice(&key);
        blob
    }

    /// OpenSSH-style fingerprint (`SHA256:<base64>`).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_key_blob());
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }

    /// `authorized_keys`-style public key line.
    pub fn public_key_line(&self) -> String {
        format!(
            "{} {}",
            KEY_TYPE,
            base64::engine::general_purpose::STANDARD.encode(self.public_key_blob())
        )
    }

    /// Key pair for the SSH server configuration.
    pub fn to_key_pair(&self) -> russh_keys::key::KeyPair {
        russh_keys::key::KeyPair::Ed25519(self.signing_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_persists_and_reloads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys").join("host_key");

        let first = HostIdentity::load_or_generate(&path);
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap().len(), SECRET_KEY_LENGTH);

        let second = HostIdentity::load_or_generate(&path);
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("host_key");
        fs::write(&path, b"short").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        HostIdentity::load_or_generate(&path);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key_is_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("host_key");
        fs::write(&path, b"not a key").unwrap();

        let identity = HostIdentity::load_or_generate(&path);
        let stored = fs::read(&path).unwrap();
        assert_eq!(stored.len(), SECRET_KEY_LENGTH);

        let reloaded = HostIdentity::load_or_generate(&path);
        assert_eq!(identity.public_key_bytes(), reloaded.public_key_bytes());
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        // Parent is a regular file, so the key cannot be written.
        let path = blocker.join("host_key");

        let identity = HostIdentity::load_or_generate(&path);
        assert!(!path.exists());
        assert!(identity.fingerprint().starts_with("SHA256:"));

        assert!(matches!(
            identity.persist(&path),
            Err(IdentityError::KeyPersistenceFailure { .. })
        ));
    }

    #[test]
    fn test_public_key_blob_layout() {
        let identity = HostIdentity::from_secret_key_bytes(&[7u8; 32]);
        let blob = identity.public_key_blob();
        assert_eq!(&blob[..4], &11u32.to_be_bytes());
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(&blob[15..19], &32u32.to_be_bytes());
        assert_eq!(&blob[19..], &identity.public_key_bytes());
        assert!(identity.public_key_line().starts_with("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = HostIdentity::from_secret_key_bytes(&[7u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(debug.contains("SHA256:"));
        assert!(!debug.contains("signing_key"));
    }
}
