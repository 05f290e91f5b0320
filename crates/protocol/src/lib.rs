//! # weblist Protocol Library
//!
//! Wire-level definitions for the read-only file-transfer session served by
//! the weblist daemon.
//!
//! ## Overview
//!
//! - **Message Definitions**: SFTP version 3 requests and responses, file
//!   attributes, open flags and status codes
//! - **Packet Framing**: length-prefixed packets with a hard size ceiling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          SFTP v3 Messages               │  Request / Response
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  u32 length prefix
//! ├─────────────────────────────────────────┤
//! │       SSH channel (subsystem "sftp")    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{PacketCodec, Request, Response, StatusCode};
//!
//! let request = Request::Stat { id: 1, path: "/docs".to_string() };
//! let codec = PacketCodec::new();
//! let packet = codec.encode(&request.encode()).unwrap();
//!
//! let (payload, _) = codec.try_decode(&packet).unwrap().unwrap();
//! assert_eq!(Request::decode(&payload).unwrap(), request);
//!
//! let reply = Response::status(1, StatusCode::NoSuchFile, "no such file");
//! assert!(!reply.encode().is_empty());
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: SFTP message definitions and codec
//! - [`framing`]: Packet codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{PacketCodec, LENGTH_PREFIX_SIZE, MAX_PACKET_SIZE, MAX_READ_LEN};
pub use messages::{
    peek_request_id, FileAttrs, MessageType, NameEntry, OpenFlags, Request, Response, StatusCode,
    SFTP_VERSION,
};
