//! Size-adaptive positional reads.
//!
//! The strategy is picked once when a file is opened: small files are read
//! whole into memory, large files keep their handle and serve each read with
//! seek-then-read under a per-handle lock.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

use super::jail::{DirectoryEntry, JailError};
use super::path::JailPath;

/// Default size at which reads switch from memory to seek-based access.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 10 * 1024 * 1024;

/// How an open file serves reads.
#[derive(Debug)]
pub enum ReaderStrategy {
    /// The whole file, read at open time.
    InMemory(Bytes),
    /// An open handle and the size observed at open time.
    Seek { file: Mutex<File>, size: u64 },
}

impl ReaderStrategy {
    /// Choose a strategy for `file` of `size` bytes.
    pub fn select(mut file: File, size: u64, threshold: u64) -> Result<Self, JailError> {
        if size < threshold {
            let mut buf = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buf)?;
            Ok(ReaderStrategy::InMemory(Bytes::from(buf)))
        } else {
            Ok(ReaderStrategy::Seek {
                file: Mutex::new(file),
                size,
            })
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ReaderStrategy::InMemory(data) => data.len() as u64,
            ReaderStrategy::Seek { size, .. } => *size,
        }
    }
}

/// Result of a positional read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Bytes,
    /// The read reached the end of the file.
    pub eof: bool,
}

/// A file opened through the jail.
#[derive(Debug)]
pub struct OpenFile {
    path: JailPath,
    entry: DirectoryEntry,
    strategy: ReaderStrategy,
}

impl OpenFile {
    pub(crate) fn new(path: JailPath, entry: DirectoryEntry, strategy: ReaderStrategy) -> Self {
        Self {
            path,
            entry,
            strategy,
        }
    }

    pub fn path(&self) -> &JailPath {
        &self.path
    }

    /// Metadata captured at open time.
    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    pub fn size(&self) -> u64 {
        self.strategy.size()
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.strategy, ReaderStrategy::InMemory(_))
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// A read starting at or past the end yields no data and `eof`. A read
    /// that reaches the end yields the available bytes and `eof`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<ReadOutcome, JailError> {
        let size = self.size();
        if offset >= size {
            return Ok(ReadOutcome {
                data: Bytes::new(),
                eof: true,
            });
        }

        let want = (len as u64).min(size - offset);
        let data = match &self.strategy {
            ReaderStrategy::InMemory(buf) => {
                let start = offset as usize;
                buf.slice(start..start + want as usize)
            }
            ReaderStrategy::Seek { file, .. } => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = Vec::with_capacity(want as usize);
                (&mut *file).take(want).read_to_end(&mut buf)?;
                Bytes::from(buf)
            }
        };

        // A short read means the file shrank under us.
        let eof = offset + data.len() as u64 >= size || (data.len() as u64) < want;
        Ok(ReadOutcome { data, eof })
    }
}
