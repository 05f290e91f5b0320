//! Filesystem access confined to a single root directory.
//!
//! [`RootedFs`] only ever joins validated [`JailPath`] segments onto a
//! canonical root. Symbolic links are never followed: a link anywhere along
//! a resolved path makes the path behave as if it did not exist.

use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use super::jail::JailError;
use super::path::JailPath;

/// Raw directory entry returned by [`RootedFs::read_dir`].
#[derive(Debug)]
pub struct RawEntry {
    pub name: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct RootedFs {
    root: PathBuf,
}

impl RootedFs {
    /// Open a rooted view. The root must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve to a host path, refusing any symlink component.
    fn resolve(&self, path: &JailPath) -> Result<(PathBuf, Metadata), JailError> {
        let mut current = self.root.clone();
        let mut metadata = fs::symlink_metadata(&current)?;

        for segment in path.segments() {
            current.push(segment);
            metadata = fs::symlink_metadata(&current).map_err(|e| not_found_or(e, path))?;
            if metadata.file_type().is_symlink() {
                tracing::debug!(path = %path, "Refusing to follow symlink");
                return Err(JailError::NotFound(path.to_string()));
            }
        }

        Ok((current, metadata))
    }

    pub fn metadata(&self, path: &JailPath) -> Result<Metadata, JailError> {
        self.resolve(path).map(|(_, metadata)| metadata)
    }

    /// Entries of a directory, symlinks omitted.
    pub fn read_dir(&self, path: &JailPath) -> Result<Vec<RawEntry>, JailError> {
        let (host_path, metadata) = self.resolve(path)?;
        if !metadata.is_dir() {
            return Err(JailError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&host_path)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let metadata = match fs::symlink_metadata(entry.path()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.file_type().is_symlink() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    tracing::debug!(name = ?raw, "Skipping entry with non UTF-8 name");
                    continue;
                }
            };
            entries.push(RawEntry { name, metadata });
        }
        Ok(entries)
    }

    /// Open a regular file for reading.
    pub fn open(&self, path: &JailPath) -> Result<(File, Metadata), JailError> {
        let (host_path, metadata) = self.resolve(path)?;
        if metadata.is_dir() {
            return Err(JailError::IsADirectory(path.to_string()));
        }
        if !metadata.is_file() {
            return Err(JailError::NotFound(path.to_string()));
        }
        let file = File::open(&host_path).map_err(|e| not_found_or(e, path))?;

        // The path may have been swapped for a link between the walk and the open.
        let opened = file.metadata()?;
        if !same_file(&metadata, &opened) {
            tracing::warn!(path = %path, "File changed identity while opening");
            return Err(JailError::NotFound(path.to_string()));
        }
        Ok((file, opened))
    }
}

#[cfg(unix)]
fn same_file(checked: &Metadata, opened: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    checked.dev() == opened.dev() && checked.ino() == opened.ino() && opened.is_file()
}

#[cfg(not(unix))]
fn same_file(checked: &Metadata, opened: &Metadata) -> bool {
    opened.is_file() && checked.len() == opened.len()
}

fn not_found_or(err: io::Error, path: &JailPath) -> JailError {
    match err.kind() {
        io::ErrorKind::NotFound => JailError::NotFound(path.to_string()),
        _ => JailError::Io(err),
    }
}
