//! # weblist Daemon Library
//!
//! This crate shares one directory tree, read-only, through two front doors:
//! a cookie or Basic-auth gated web interface and an SSH server offering the
//! SFTP subsystem.
//!
//! ## Overview
//!
//! - **Credential checks**: constant-time password and public key checks,
//!   HMAC-signed session tokens, CSRF tokens for the login form
//! - **Throttling**: a per-source sliding window shared by both doors
//! - **Jailed filesystem**: path containment, exclusion patterns, a synthetic
//!   `..` entry, size-adaptive reads, refusal of every mutation
//! - **Host identity**: an Ed25519 SSH host key persisted across restarts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Daemon Orchestrator                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────────┐          ┌────────────────────────┐  │
//! │  │  Web (axum)        │          │  SSH/SFTP (russh)      │  │
//! │  │  cookie / Basic    │          │  password / publickey  │  │
//! │  └─────────┬──────────┘          └───────────┬────────────┘  │
//! │            │                                 │               │
//! │  ┌─────────┴─────────────────────────────────┴────────────┐  │
//! │  │   CredentialGate  ·  RateLimiter  ·  CsrfGuard         │  │
//! │  └────────────────────────────┬───────────────────────────┘  │
//! │                               │                              │
//! │  ┌────────────────────────────┴───────────────────────────┐  │
//! │  │               JailedFileSystem (read-only)             │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weblist_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Credentials, tokens, CSRF and rate limiting
//! - [`files`]: The jailed, read-only filesystem
//! - [`identity`]: SSH host key persistence
//! - [`sftp`]: SSH transport and SFTP request processing
//! - [`web`]: HTTP login, listing and download
//! - [`orchestrator`]: Main daemon coordinator

pub mod auth;
pub mod config;
pub mod files;
pub mod identity;
pub mod orchestrator;
pub mod sftp;
pub mod web;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export auth types for convenience
pub use auth::{AuthError, AuthorizedKeys, CredentialGate, CsrfGuard, RateLimiter, SessionTokens};

// Re-export files types for convenience
pub use files::{DirectoryEntry, EntryKind, ExclusionSet, JailError, JailedFileSystem};

// Re-export identity types for convenience
pub use identity::{HostIdentity, IdentityError};

// Re-export SFTP types for convenience
pub use sftp::{ConnectionState, SessionError, SftpContext, SftpServer, SftpSession};

// Re-export web types for convenience
pub use web::WebState;

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorState};
