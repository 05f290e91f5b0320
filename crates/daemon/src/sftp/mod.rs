//! SSH front door serving the read-only SFTP subsystem.
//!
//! This module provides:
//! - [`SftpServer`]: TCP accept loop and per-connection SSH sessions
//! - [`SshSessionHandler`]: authentication and channel handling for one connection
//! - [`SftpSession`]: the file-transfer request processor for one channel
//! - [`ConnectionTracker`]: per-connection lifecycle state machine
//! - [`IdleTimeoutStream`]: transport wrapper closing idle connections

pub mod idle;
pub mod server;
pub mod session;
pub mod state;

use thiserror::Error;

pub use idle::IdleTimeoutStream;
pub use server::{SftpContext, SftpServer, SshSessionHandler, SUBSYSTEM_NAME};
pub use session::{SftpSession, MAX_OPEN_HANDLES, READDIR_BATCH};
pub use state::{ConnectionState, ConnectionTracker};

/// Errors that end a connection or channel.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport idle timeout")]
    TransportIdleTimeout,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("too many authentication attempts ({0})")]
    TooManyAuthAttempts(u32),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("SSH transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            SessionError::TransportIdleTimeout
        } else {
            SessionError::Io(err)
        }
    }
}
