//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A packet ended before a field could be read, or a field was invalid.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The packet type byte is not a known request type.
    #[error("unknown message type: {0}")]
    UnknownMessage(u8),

    /// Packet exceeds maximum allowed size.
    #[error("packet too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared packet size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer closed the stream in the middle of a packet.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Shorthand used by the decoders when a field runs past the packet end.
    pub(crate) fn truncated(field: &str) -> Self {
        ProtocolError::Malformed(format!("truncated {}", field))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ProtocolError::Malformed(format!("invalid utf-8 string: {}", err))
    }
}
