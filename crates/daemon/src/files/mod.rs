//! Jailed, read-only access to the shared directory tree.
//!
//! This module provides:
//! - Path containment and normalization for peer-supplied paths
//! - Exclusion patterns that hide sensitive entries
//! - Directory listing with a synthetic `..` entry
//! - Size-adaptive positional file reads
//! - Refusal of every mutating operation
//!
//! # Security
//!
//! Paths are validated before any filesystem access. Symbolic links are
//! never followed or reported, and the tree is never modified.

pub mod jail;
pub mod path;
pub mod reader;
pub mod rooted;

pub use jail::{DirectoryEntry, EntryKind, JailError, JailedFileSystem, ACCESS_DENIED, NOT_PERMITTED};
pub use path::{secure_path, ExclusionSet, JailPath};
pub use reader::{OpenFile, ReadOutcome, ReaderStrategy, DEFAULT_MEMORY_THRESHOLD};
pub use rooted::RootedFs;
