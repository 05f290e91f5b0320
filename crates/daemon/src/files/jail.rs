//! The jailed, read-only filesystem served to remote peers.
//!
//! [`JailedFileSystem`] is the only component that turns a peer-supplied
//! path into filesystem access. It offers three groups of operations:
//!
//! - **Lister**: [`list`](JailedFileSystem::list), [`stat`](JailedFileSystem::stat)
//! - **Reader**: [`open`](JailedFileSystem::open)
//! - **Denied writer**: every mutating call fails with
//!   [`JailError::ReadOnlyViolation`] before the path is even looked at,
//!   and [`read_link`](JailedFileSystem::read_link) always fails with
//!   [`JailError::SymlinkUnsupported`].

use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{FileAttrs, StatusCode};
use serde::Serialize;
use thiserror::Error;

use super::path::{secure_path, ExclusionSet, JailPath};
use super::reader::{OpenFile, ReaderStrategy, DEFAULT_MEMORY_THRESHOLD};
use super::rooted::RootedFs;

/// Peer-visible text for containment denials.
pub const ACCESS_DENIED: &str = "access denied";
/// Peer-visible text for refused operations.
pub const NOT_PERMITTED: &str = "operation not permitted";

/// Mode bits of the synthetic `..` entry.
const VIRTUAL_DIR_MODE: u32 = 0o040555;
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Errors raised by the jail.
#[derive(Debug, Error)]
pub enum JailError {
    #[error("path traversal denied: {0}")]
    PathTraversalDenied(String),

    #[error("path is excluded: {0}")]
    ExcludedPath(String),

    #[error("filesystem is read-only")]
    ReadOnlyViolation,

    #[error("symbolic links are not supported")]
    SymlinkUnsupported,

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JailError {
    /// SFTP status code reported for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            JailError::PathTraversalDenied(_)
            | JailError::ExcludedPath(_)
            | JailError::ReadOnlyViolation => StatusCode::PermissionDenied,
            JailError::SymlinkUnsupported => StatusCode::OpUnsupported,
            JailError::NotFound(_) => StatusCode::NoSuchFile,
            JailError::NotADirectory(_) | JailError::IsADirectory(_) => StatusCode::Failure,
            JailError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
        }
    }

    /// Text shown to the peer. Never contains a path.
    pub fn peer_message(&self) -> &'static str {
        match self {
            JailError::PathTraversalDenied(_) | JailError::ExcludedPath(_) => ACCESS_DENIED,
            JailError::ReadOnlyViolation | JailError::SymlinkUnsupported => NOT_PERMITTED,
            JailError::NotFound(_) => "no such file",
            JailError::NotADirectory(_) => "not a directory",
            JailError::IsADirectory(_) => "is a directory",
            JailError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => ACCESS_DENIED,
            JailError::Io(_) => "failure",
        }
    }

    /// Whether this is a policy denial worth a warning in the logs.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            JailError::PathTraversalDenied(_)
                | JailError::ExcludedPath(_)
                | JailError::ReadOnlyViolation
                | JailError::SymlinkUnsupported
        )
    }
}

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A directory entry as presented to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix mode including file type bits, write bits cleared.
    pub mode: u32,
    /// Last modified time, seconds since the epoch.
    pub modified: u64,
}

impl DirectoryEntry {
    /// The synthetic `..` navigation entry.
    pub fn parent_link() -> Self {
        Self {
            name: "..".to_string(),
            kind: EntryKind::Directory,
            size: 0,
            mode: VIRTUAL_DIR_MODE,
            modified: unix_now(),
        }
    }

    fn from_metadata(name: String, metadata: &Metadata) -> Self {
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            name,
            kind,
            size: if kind == EntryKind::Directory { 0 } else { metadata.len() },
            mode: presented_mode(metadata, kind),
            modified,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// SFTP attributes for this entry.
    pub fn to_attrs(&self) -> FileAttrs {
        let modified = u32::try_from(self.modified).unwrap_or(u32::MAX);
        FileAttrs {
            size: Some(self.size),
            uid_gid: None,
            permissions: Some(self.mode),
            atime_mtime: Some((modified, modified)),
        }
    }

    /// `ls -l` style line used as the SFTP long name.
    pub fn longname(&self) -> String {
        format!(
            "{} 1 owner group {:>12} {}",
            mode_string(self.mode),
            self.size,
            self.name
        )
    }
}

#[cfg(unix)]
fn presented_mode(metadata: &Metadata, kind: EntryKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode();
    let type_bits = match kind {
        EntryKind::Directory => S_IFDIR,
        EntryKind::File => S_IFREG,
    };
    type_bits | (mode & 0o7777 & !0o222)
}

#[cfg(not(unix))]
fn presented_mode(_metadata: &Metadata, kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Directory => S_IFDIR | 0o555,
        EntryKind::File => S_IFREG | 0o444,
    }
}

fn mode_string(mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(if mode & S_IFMT == S_IFDIR { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Read-only view of a directory tree.
#[derive(Debug, Clone)]
pub struct JailedFileSystem {
    fs: RootedFs,
    exclusions: ExclusionSet,
    memory_threshold: u64,
}

impl JailedFileSystem {
    /// Create a jail rooted at `root`.
    pub fn new(root: impl AsRef<Path>, exclusions: ExclusionSet) -> std::io::Result<Self> {
        Ok(Self {
            fs: RootedFs::new(root)?,
            exclusions,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        })
    }

    /// Set the size at which reads switch to the seek strategy.
    pub fn with_memory_threshold(mut self, threshold: u64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// Validate a peer path against containment and exclusion rules.
    pub fn secure_path(&self, request: &str) -> Result<JailPath, JailError> {
        secure_path(request, &self.exclusions)
    }

    // ------------------------------------------------------------------
    // Lister
    // ------------------------------------------------------------------

    /// List a directory, `..` first, then entries sorted by name.
    ///
    /// A file target yields a listing holding only that file.
    pub fn list(&self, request: &str) -> Result<Vec<DirectoryEntry>, JailError> {
        let path = self.secure_path(request)?;
        let metadata = self.fs.metadata(&path)?;

        if !metadata.is_dir() {
            let name = path.file_name().to_string();
            return Ok(vec![DirectoryEntry::from_metadata(name, &metadata)]);
        }

        let mut entries: Vec<DirectoryEntry> = self
            .fs
            .read_dir(&path)?
            .into_iter()
            .filter(|raw| !self.exclusions.is_excluded(path.join(&raw.name).as_str()))
            .map(|raw| DirectoryEntry::from_metadata(raw.name, &raw.metadata))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        entries.insert(0, DirectoryEntry::parent_link());
        Ok(entries)
    }

    /// Metadata for a single path.
    pub fn stat(&self, request: &str) -> Result<DirectoryEntry, JailError> {
        let path = self.secure_path(request)?;
        let metadata = self.fs.metadata(&path)?;
        Ok(DirectoryEntry::from_metadata(
            path.file_name().to_string(),
            &metadata,
        ))
    }

    /// Canonical absolute form of a path, for REALPATH.
    pub fn canonical(&self, request: &str) -> Result<String, JailError> {
        Ok(self.secure_path(request)?.to_absolute())
    }

    // ------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------

    /// Open a regular file for reading.
    pub fn open(&self, request: &str) -> Result<OpenFile, JailError> {
        let path = self.secure_path(request)?;
        let (file, metadata) = self.fs.open(&path)?;
        let entry = DirectoryEntry::from_metadata(path.file_name().to_string(), &metadata);
        let strategy = ReaderStrategy::select(file, metadata.len(), self.memory_threshold)?;

        tracing::debug!(
            path = %path,
            size = metadata.len(),
            in_memory = matches!(strategy, ReaderStrategy::InMemory(_)),
            "Opened file"
        );
        Ok(OpenFile::new(path, entry, strategy))
    }

    /// Symbolic links are never reported.
    pub fn read_link(&self, _request: &str) -> Result<String, JailError> {
        Err(JailError::SymlinkUnsupported)
    }

    // ------------------------------------------------------------------
    // Denied writer
    // ------------------------------------------------------------------

    pub fn write(&self, _request: &str, _offset: u64, _data: &[u8]) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn create(&self, _request: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn remove(&self, _request: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn rename(&self, _from: &str, _to: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn mkdir(&self, _request: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn rmdir(&self, _request: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn set_attributes(&self, _request: &str, _attrs: &FileAttrs) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }

    pub fn symlink(&self, _link: &str, _target: &str) -> Result<(), JailError> {
        Err(JailError::ReadOnlyViolation)
    }
}
