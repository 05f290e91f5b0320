//! File-transfer protocol message definitions.
//!
//! This module defines the SFTP version 3 requests accepted by the server and
//! the responses it sends back, together with their binary encoding
//! (draft-ietf-secsh-filexfer-02). All integers are big-endian; strings are
//! a `u32` length followed by raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Protocol version spoken by the server.
pub const SFTP_VERSION: u32 = 3;

/// Wire message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        let ty = match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(ty)
    }
}

/// Status codes carried in STATUS responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    /// Returns the numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a numeric wire value.
    pub fn from_u32(value: u32) -> Result<Self> {
        let code = match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unknown status code {}",
                    other
                )))
            }
        };
        Ok(code)
    }
}

/// Flags of an OPEN request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    const MUTATING: u32 = Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC | Self::EXCL;

    /// Whether the open asks for anything beyond reading.
    pub fn is_mutating(self) -> bool {
        self.0 & Self::MUTATING != 0
    }
}

/// File attributes (the ATTRS structure).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub atime_mtime: Option<(u32, u32)>,
}

impl FileAttrs {
    pub const FLAG_SIZE: u32 = 0x0000_0001;
    pub const FLAG_UIDGID: u32 = 0x0000_0002;
    pub const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    pub const FLAG_ACMODTIME: u32 = 0x0000_0008;
    pub const FLAG_EXTENDED: u32 = 0x8000_0000;

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime_mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }
        flags
    }

    /// Append the encoded attributes to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_u32(self.flags());
        if let Some(size) = self.size {
            out.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            out.put_u32(uid);
            out.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            out.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.atime_mtime {
            out.put_u32(atime);
            out.put_u32(mtime);
        }
    }

    /// Decode attributes, skipping any extended pairs.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let flags = get_u32(buf, "attr flags")?;
        let mut attrs = FileAttrs::default();
        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(get_u64(buf, "attr size")?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid_gid = Some((get_u32(buf, "attr uid")?, get_u32(buf, "attr gid")?));
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(get_u32(buf, "attr permissions")?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime_mtime = Some((get_u32(buf, "attr atime")?, get_u32(buf, "attr mtime")?));
        }
        if flags & Self::FLAG_EXTENDED != 0 {
            let count = get_u32(buf, "attr extended count")?;
            for _ in 0..count {
                get_bytes(buf, "attr extended type")?;
                get_bytes(buf, "attr extended data")?;
            }
        }
        Ok(attrs)
    }
}

/// One entry of a NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init { version: u32 },
    Open { id: u32, path: String, flags: OpenFlags, attrs: FileAttrs },
    Close { id: u32, handle: Bytes },
    Read { id: u32, handle: Bytes, offset: u64, len: u32 },
    Write { id: u32, handle: Bytes, offset: u64, data: Bytes },
    Lstat { id: u32, path: String },
    Fstat { id: u32, handle: Bytes },
    Setstat { id: u32, path: String, attrs: FileAttrs },
    Fsetstat { id: u32, handle: Bytes, attrs: FileAttrs },
    Opendir { id: u32, path: String },
    Readdir { id: u32, handle: Bytes },
    Remove { id: u32, path: String },
    Mkdir { id: u32, path: String, attrs: FileAttrs },
    Rmdir { id: u32, path: String },
    Realpath { id: u32, path: String },
    Stat { id: u32, path: String },
    Rename { id: u32, from: String, to: String },
    Readlink { id: u32, path: String },
    Symlink { id: u32, link: String, target: String },
    Extended { id: u32, name: String },
}

impl Request {
    /// The request id, absent only for INIT.
    pub fn id(&self) -> Option<u32> {
        match self {
            Request::Init { .. } => None,
            Request::Open { id, .. }
            | Request::Close { id, .. }
            | Request::Read { id, .. }
            | Request::Write { id, .. }
            | Request::Lstat { id, .. }
            | Request::Fstat { id, .. }
            | Request::Setstat { id, .. }
            | Request::Fsetstat { id, .. }
            | Request::Opendir { id, .. }
            | Request::Readdir { id, .. }
            | Request::Remove { id, .. }
            | Request::Mkdir { id, .. }
            | Request::Rmdir { id, .. }
            | Request::Realpath { id, .. }
            | Request::Stat { id, .. }
            | Request::Rename { id, .. }
            | Request::Readlink { id, .. }
            | Request::Symlink { id, .. }
            | Request::Extended { id, .. } => Some(*id),
        }
    }

    /// Whether the request would modify the filesystem if honored.
    pub fn is_mutating(&self) -> bool {
        match self {
            Request::Open { flags, .. } => flags.is_mutating(),
            Request::Write { .. }
            | Request::Setstat { .. }
            | Request::Fsetstat { .. }
            | Request::Remove { .. }
            | Request::Mkdir { .. }
            | Request::Rmdir { .. }
            | Request::Rename { .. }
            | Request::Symlink { .. } => true,
            _ => false,
        }
    }

    /// Decode a request from a packet payload (type byte included).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let ty = MessageType::try_from(get_u8(&mut buf, "message type")?)?;

        if ty == MessageType::Init {
            let version = get_u32(&mut buf, "version")?;
            // Init may carry extension pairs we do not use.
            return Ok(Request::Init { version });
        }

        let id = get_u32(&mut buf, "request id")?;
        let buf = &mut buf;
        let request = match ty {
            MessageType::Open => Request::Open {
                id,
                path: get_string(buf, "path")?,
                flags: OpenFlags(get_u32(buf, "pflags")?),
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Close => Request::Close {
                id,
                handle: get_bytes(buf, "handle")?,
            },
            MessageType::Read => Request::Read {
                id,
                handle: get_bytes(buf, "handle")?,
                offset: get_u64(buf, "offset")?,
                len: get_u32(buf, "length")?,
            },
            MessageType::Write => Request::Write {
                id,
                handle: get_bytes(buf, "handle")?,
                offset: get_u64(buf, "offset")?,
                data: get_bytes(buf, "data")?,
            },
            MessageType::Lstat => Request::Lstat {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Fstat => Request::Fstat {
                id,
                handle: get_bytes(buf, "handle")?,
            },
            MessageType::Setstat => Request::Setstat {
                id,
                path: get_string(buf, "path")?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Fsetstat => Request::Fsetstat {
                id,
                handle: get_bytes(buf, "handle")?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Opendir => Request::Opendir {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Readdir => Request::Readdir {
                id,
                handle: get_bytes(buf, "handle")?,
            },
            MessageType::Remove => Request::Remove {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Mkdir => Request::Mkdir {
                id,
                path: get_string(buf, "path")?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Rmdir => Request::Rmdir {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Realpath => Request::Realpath {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Stat => Request::Stat {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Rename => Request::Rename {
                id,
                from: get_string(buf, "old path")?,
                to: get_string(buf, "new path")?,
            },
            MessageType::Readlink => Request::Readlink {
                id,
                path: get_string(buf, "path")?,
            },
            MessageType::Symlink => Request::Symlink {
                id,
                link: get_string(buf, "link path")?,
                target: get_string(buf, "target path")?,
            },
            MessageType::Extended => Request::Extended {
                id,
                name: get_string(buf, "extension name")?,
            },
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "{:?} is not a client request",
                    other
                )))
            }
        };
        Ok(request)
    }

    /// Encode the request into a packet payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Request::Init { version } => {
                out.put_u8(MessageType::Init as u8);
                out.put_u32(*version);
            }
            Request::Open { id, path, flags, attrs } => {
                header(&mut out, MessageType::Open, *id);
                put_string(&mut out, path);
                out.put_u32(flags.0);
                attrs.encode_into(&mut out);
            }
            Request::Close { id, handle } => {
                header(&mut out, MessageType::Close, *id);
                put_bytes(&mut out, handle);
            }
            Request::Read { id, handle, offset, len } => {
                header(&mut out, MessageType::Read, *id);
                put_bytes(&mut out, handle);
                out.put_u64(*offset);
                out.put_u32(*len);
            }
            Request::Write { id, handle, offset, data } => {
                header(&mut out, MessageType::Write, *id);
                put_bytes(&mut out, handle);
                out.put_u64(*offset);
                put_bytes(&mut out, data);
            }
            Request::Lstat { id, path } => path_request(&mut out, MessageType::Lstat, *id, path),
            Request::Fstat { id, handle } => {
                header(&mut out, MessageType::Fstat, *id);
                put_bytes(&mut out, handle);
            }
            Request::Setstat { id, path, attrs } => {
                path_request(&mut out, MessageType::Setstat, *id, path);
                attrs.encode_into(&mut out);
            }
            Request::Fsetstat { id, handle, attrs } => {
                header(&mut out, MessageType::Fsetstat, *id);
                put_bytes(&mut out, handle);
                attrs.encode_into(&mut out);
            }
            Request::Opendir { id, path } => {
                path_request(&mut out, MessageType::Opendir, *id, path)
            }
            Request::Readdir { id, handle } => {
                header(&mut out, MessageType::Readdir, *id);
                put_bytes(&mut out, handle);
            }
            Request::Remove { id, path } => path_request(&mut out, MessageType::Remove, *id, path),
            Request::Mkdir { id, path, attrs } => {
                path_request(&mut out, MessageType::Mkdir, *id, path);
                attrs.encode_into(&mut out);
            }
            Request::Rmdir { id, path } => path_request(&mut out, MessageType::Rmdir, *id, path),
            Request::Realpath { id, path } => {
                path_request(&mut out, MessageType::Realpath, *id, path)
            }
            Request::Stat { id, path } => path_request(&mut out, MessageType::Stat, *id, path),
            Request::Rename { id, from, to } => {
                path_request(&mut out, MessageType::Rename, *id, from);
                put_string(&mut out, to);
            }
            Request::Readlink { id, path } => {
                path_request(&mut out, MessageType::Readlink, *id, path)
            }
            Request::Symlink { id, link, target } => {
                path_request(&mut out, MessageType::Symlink, *id, link);
                put_string(&mut out, target);
            }
            Request::Extended { id, name } => {
                path_request(&mut out, MessageType::Extended, *id, name)
            }
        }
        out.freeze()
    }
}

/// Best-effort extraction of a request id from a payload that failed to decode.
///
/// Lets the server answer `BAD_MESSAGE` to the right request instead of
/// dropping the session.
pub fn peek_request_id(payload: &[u8]) -> Option<u32> {
    if payload.len() < 5 || payload[0] == MessageType::Init as u8 {
        return None;
    }
    Some(u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]))
}

/// Responses the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version { version: u32 },
    Status { id: u32, code: StatusCode, message: String },
    Handle { id: u32, handle: Bytes },
    Data { id: u32, data: Bytes },
    Name { id: u32, entries: Vec<NameEntry> },
    Attrs { id: u32, attrs: FileAttrs },
}

impl Response {
    /// Convenience constructor for a STATUS response.
    pub fn status(id: u32, code: StatusCode, message: impl Into<String>) -> Self {
        Response::Status {
            id,
            code,
            message: message.into(),
        }
    }

    /// Encode the response into a packet payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Response::Version { version } => {
                out.put_u8(MessageType::Version as u8);
                out.put_u32(*version);
            }
            Response::Status { id, code, message } => {
                header(&mut out, MessageType::Status, *id);
                out.put_u32(code.as_u32());
                put_string(&mut out, message);
                put_string(&mut out, "en");
            }
            Response::Handle { id, handle } => {
                header(&mut out, MessageType::Handle, *id);
                put_bytes(&mut out, handle);
            }
            Response::Data { id, data } => {
                header(&mut out, MessageType::Data, *id);
                put_bytes(&mut out, data);
            }
            Response::Name { id, entries } => {
                header(&mut out, MessageType::Name, *id);
                out.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut out, &entry.filename);
                    put_string(&mut out, &entry.longname);
                    entry.attrs.encode_into(&mut out);
                }
            }
            Response::Attrs { id, attrs } => {
                header(&mut out, MessageType::Attrs, *id);
                attrs.encode_into(&mut out);
            }
        }
        out.freeze()
    }

    /// Decode a response payload. Used by clients and tests.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let ty = MessageType::try_from(get_u8(&mut buf, "message type")?)?;
        let buf = &mut buf;
        let response = match ty {
            MessageType::Version => Response::Version {
                version: get_u32(buf, "version")?,
            },
            MessageType::Status => {
                let id = get_u32(buf, "request id")?;
                let code = StatusCode::from_u32(get_u32(buf, "status code")?)?;
                let message = get_string(buf, "status message")?;
                // Language tag is optional in practice.
                if !buf.is_empty() {
                    get_string(buf, "language tag")?;
                }
                Response::Status { id, code, message }
            }
            MessageType::Handle => Response::Handle {
                id: get_u32(buf, "request id")?,
                handle: get_bytes(buf, "handle")?,
            },
            MessageType::Data => Response::Data {
                id: get_u32(buf, "request id")?,
                data: get_bytes(buf, "data")?,
            },
            MessageType::Name => {
                let id = get_u32(buf, "request id")?;
                let count = get_u32(buf, "name count")?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: get_string(buf, "filename")?,
                        longname: get_string(buf, "longname")?,
                        attrs: FileAttrs::decode(buf)?,
                    });
                }
                Response::Name { id, entries }
            }
            MessageType::Attrs => Response::Attrs {
                id: get_u32(buf, "request id")?,
                attrs: FileAttrs::decode(buf)?,
            },
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "{:?} is not a server response",
                    other
                )))
            }
        };
        Ok(response)
    }
}

// ============================================================================
// Primitive codec helpers
// ============================================================================

fn header(out: &mut BytesMut, ty: MessageType, id: u32) {
    out.put_u8(ty as u8);
    out.put_u32(id);
}

fn path_request(out: &mut BytesMut, ty: MessageType, id: u32, path: &str) {
    header(out, ty, id);
    put_string(out, path);
}

/// Append an SSH string.
pub fn put_string(out: &mut BytesMut, value: &str) {
    put_bytes(out, value.as_bytes());
}

/// Append an SSH byte string.
pub fn put_bytes(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], field: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::truncated(field));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], field: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::truncated(field));
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut &[u8], field: &str) -> Result<Bytes> {
    let len = get_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::truncated(field));
    }
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(value)
}

fn get_string(buf: &mut &[u8], field: &str) -> Result<String> {
    let raw = get_bytes(buf, field)?;
    Ok(String::from_utf8(raw.to_vec())?)
}
