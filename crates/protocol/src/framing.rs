//! Length-prefixed packet framing for the file-transfer channel.
//!
//! # Packet Format
//!
//! Each packet on the channel consists of:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload (first byte is the message type)
//!
//! The length prefix never counts itself. Packets larger than
//! [`MAX_PACKET_SIZE`] are rejected before any allocation happens, so a
//! hostile length field cannot make the server reserve arbitrary memory.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted payload size (256 KB, the common client ceiling).
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Largest data block returned by a single READ response.
///
/// Leaves room for the response header inside [`MAX_PACKET_SIZE`].
pub const MAX_READ_LEN: u32 = 255 * 1024;

/// Encoder and decoder for length-prefixed packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Create a codec with the default size ceiling.
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Create a codec with a custom size ceiling.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Returns the configured ceiling.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Encode a payload into a framed packet.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_packet_size,
            });
        }

        let mut output = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        output.put_u32(payload.len() as u32);
        output.put_slice(payload);
        Ok(output.freeze())
    }

    /// Validate a length prefix read from the wire.
    pub fn check_length(&self, declared: u32) -> Result<usize> {
        let declared = declared as usize;
        if declared > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: self.max_packet_size,
            });
        }
        if declared == 0 {
            return Err(ProtocolError::Malformed("empty packet".to_string()));
        }
        Ok(declared)
    }

    /// Try to decode one packet from the front of `data`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the payload
    /// and the number of bytes consumed.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Bytes, usize)>> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let len = self.check_length(declared)?;

        let total = LENGTH_PREFIX_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&data[LENGTH_PREFIX_SIZE..total]);
        Ok(Some((payload, total)))
    }
}
