//! Request processor for one SFTP channel.
//!
//! Packets are processed strictly in order. Filesystem work runs on the
//! blocking pool; the handle table lives with the session and is dropped
//! when the channel ends.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use protocol::{
    peek_request_id, FileAttrs, NameEntry, PacketCodec, ProtocolError, Request, Response,
    StatusCode, LENGTH_PREFIX_SIZE, MAX_READ_LEN, SFTP_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::SessionError;
use crate::files::{DirectoryEntry, JailError, JailedFileSystem, OpenFile};

/// Entries returned per READDIR response.
pub const READDIR_BATCH: usize = 100;

/// Open handles allowed per channel.
pub const MAX_OPEN_HANDLES: usize = 256;

enum Handle {
    File(Arc<OpenFile>),
    Dir(DirHandle),
}

struct DirHandle {
    path: String,
    attrs: FileAttrs,
    pending: VecDeque<DirectoryEntry>,
}

impl Handle {
    fn path(&self) -> &str {
        match self {
            Handle::File(file) => file.path().as_str(),
            Handle::Dir(dir) => &dir.path,
        }
    }
}

/// One SFTP channel.
pub struct SftpSession {
    jail: Arc<JailedFileSystem>,
    peer: String,
    handles: HashMap<u32, Handle>,
    next_handle: u32,
    initialized: bool,
}

impl SftpSession {
    pub fn new(jail: Arc<JailedFileSystem>) -> Self {
        Self {
            jail,
            peer: "local".to_string(),
            handles: HashMap::new(),
            next_handle: 0,
            initialized: false,
        }
    }

    /// Label used in log lines.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Run the channel until the peer closes it.
    pub async fn serve<S>(mut self, mut stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = PacketCodec::new();
        debug!(peer = %self.peer, "SFTP channel started");

        let result = loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            match stream.read_exact(&mut prefix).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => break Err(e.into()),
            }

            let len = match codec.check_length(u32::from_be_bytes(prefix)) {
                Ok(len) => len,
                Err(e) => break Err(e.into()),
            };
            let mut payload = vec![0u8; len];
            if let Err(e) = stream.read_exact(&mut payload).await {
                break Err(e.into());
            }

            let response = match self.handle_packet(&payload).await {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(e) => break Err(e),
            };

            let frame = match codec.encode(&response.encode()) {
                Ok(frame) => frame,
                Err(e) => break Err(e.into()),
            };
            if let Err(e) = stream.write_all(&frame).await {
                break Err(e.into());
            }
            if let Err(e) = stream.flush().await {
                break Err(e.into());
            }
        };

        debug!(
            peer = %self.peer,
            open_handles = self.handles.len(),
            "SFTP channel finished"
        );
        self.handles.clear();
        result
    }

    /// Process one decoded packet payload.
    ///
    /// Undecodable requests get a `BAD_MESSAGE` status and the session
    /// continues. Only an undecodable INIT, which carries no request id,
    /// ends the session.
    pub async fn handle_packet(&mut self, payload: &[u8]) -> Result<Option<Response>, SessionError> {
        match Request::decode(payload) {
            Ok(request) => Ok(Some(self.dispatch(request).await)),
            Err(err) => {
                let Some(id) = peek_request_id(payload) else {
                    return Err(err.into());
                };
                warn!(peer = %self.peer, id, error = %err, "Malformed request");
                let code = match err {
                    ProtocolError::UnknownMessage(_) => StatusCode::OpUnsupported,
                    _ => StatusCode::BadMessage,
                };
                Ok(Some(Response::status(id, code, "bad message")))
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        if let Request::Init { version } = request {
            debug!(peer = %self.peer, client_version = version, "SFTP init");
            self.initialized = true;
            return Response::Version {
                version: SFTP_VERSION,
            };
        }

        let id = request.id().unwrap_or(0);
        if !self.initialized {
            return Response::status(id, StatusCode::BadMessage, "session not initialized");
        }

        match request {
            Request::Init { .. } => Response::status(id, StatusCode::BadMessage, "already initialized"),

            Request::Open { id, path, flags, .. } => {
                if flags.is_mutating() {
                    let result = self.jail.create(&path);
                    return self.reply_ok(id, "open", &path, result);
                }
                self.open_file(id, path).await
            }
            Request::Close { id, handle } => match self.take_handle(&handle) {
                Some(_) => Response::status(id, StatusCode::Ok, ""),
                None => invalid_handle(id),
            },
            Request::Read {
                id,
                handle,
                offset,
                len,
            } => self.read(id, &handle, offset, len).await,
            Request::Write {
                id,
                handle,
                offset,
                data,
            } => {
                let path = self.handle_path(&handle);
                let result = self.jail.write(&path, offset, &data);
                self.reply_ok(id, "write", &path, result)
            }

            Request::Lstat { id, path } | Request::Stat { id, path } => {
                let jail = Arc::clone(&self.jail);
                let target = path.clone();
                match run_blocking(move || jail.stat(&target)).await {
                    Ok(entry) => Response::Attrs {
                        id,
                        attrs: entry.to_attrs(),
                    },
                    Err(err) => self.reply_error(id, "stat", &path, err),
                }
            }
            Request::Fstat { id, handle } => match self.handles.get(&handle_id(&handle)) {
                Some(Handle::File(file)) if handle.len() == 4 => Response::Attrs {
                    id,
                    attrs: file.entry().to_attrs(),
                },
                Some(Handle::Dir(dir)) if handle.len() == 4 => Response::Attrs {
                    id,
                    attrs: dir.attrs.clone(),
                },
                _ => invalid_handle(id),
            },
            Request::Setstat { id, path, attrs } => {
                let result = self.jail.set_attributes(&path, &attrs);
                self.reply_ok(id, "setstat", &path, result)
            }
            Request::Fsetstat { id, handle, attrs } => {
                let path = self.handle_path(&handle);
                let result = self.jail.set_attributes(&path, &attrs);
                self.reply_ok(id, "fsetstat", &path, result)
            }

            Request::Opendir { id, path } => self.open_dir(id, path).await,
            Request::Readdir { id, handle } => self.read_dir(id, &handle),

            Request::Remove { id, path } => {
                let result = self.jail.remove(&path);
                self.reply_ok(id, "remove", &path, result)
            }
            Request::Mkdir { id, path, .. } => {
                let result = self.jail.mkdir(&path);
                self.reply_ok(id, "mkdir", &path, result)
            }
            Request::Rmdir { id, path } => {
                let result = self.jail.rmdir(&path);
                self.reply_ok(id, "rmdir", &path, result)
            }
            Request::Rename { id, from, to } => {
                let result = self.jail.rename(&from, &to);
                self.reply_ok(id, "rename", &from, result)
            }
            Request::Symlink { id, link, target } => {
                let result = self.jail.symlink(&link, &target);
                self.reply_ok(id, "symlink", &link, result)
            }

            Request::Realpath { id, path } => match self.jail.canonical(&path) {
                Ok(absolute) => Response::Name {
                    id,
                    entries: vec![NameEntry {
                        filename: absolute.clone(),
                        longname: absolute,
                        attrs: FileAttrs::default(),
                    }],
                },
                Err(err) => self.reply_error(id, "realpath", &path, err),
            },
            Request::Readlink { id, path } => match self.jail.read_link(&path) {
                Ok(target) => Response::Name {
                    id,
                    entries: vec![NameEntry {
                        filename: target.clone(),
                        longname: target,
                        attrs: FileAttrs::default(),
                    }],
                },
                Err(err) => self.reply_error(id, "readlink", &path, err),
            },
            Request::Extended { id, name } => {
                debug!(peer = %self.peer, extension = %name, "Unsupported extension");
                Response::status(id, StatusCode::OpUnsupported, "unsupported extension")
            }
        }
    }

    async fn open_file(&mut self, id: u32, path: String) -> Response {
        if self.handles.len() >= MAX_OPEN_HANDLES {
            return Response::status(id, StatusCode::Failure, "too many open handles");
        }

        let jail = Arc::clone(&self.jail);
        let target = path.clone();
        match run_blocking(move || jail.open(&target)).await {
            Ok(file) => {
                let handle = self.insert_handle(Handle::File(Arc::new(file)));
                Response::Handle { id, handle }
            }
            Err(err) => self.reply_error(id, "open", &path, err),
        }
    }

    async fn read(&mut self, id: u32, handle: &[u8], offset: u64, len: u32) -> Response {
        let file = match self.handles.get(&handle_id(handle)) {
            Some(Handle::File(file)) if handle.len() == 4 => Arc::clone(file),
            _ => return invalid_handle(id),
        };

        let len = len.min(MAX_READ_LEN) as usize;
        let reader = Arc::clone(&file);
        match run_blocking(move || reader.read_at(offset, len)).await {
            Ok(outcome) if outcome.data.is_empty() => {
                Response::status(id, StatusCode::Eof, "end of file")
            }
            Ok(outcome) => Response::Data {
                id,
                data: outcome.data,
            },
            Err(err) => self.reply_error(id, "read", file.path().as_str(), err),
        }
    }

    async fn open_dir(&mut self, id: u32, path: String) -> Response {
        if self.handles.len() >= MAX_OPEN_HANDLES {
            return Response::status(id, StatusCode::Failure, "too many open handles");
        }

        let jail = Arc::clone(&self.jail);
        let target = path.clone();
        let listed = run_blocking(move || {
            let dir = jail.stat(&target)?;
            if !dir.is_dir() {
                return Err(JailError::NotADirectory(target));
            }
            let entries = jail.list(&target)?;
            Ok((dir, entries))
        })
        .await;

        match listed {
            Ok((dir, entries)) => {
                debug!(peer = %self.peer, path = %path, entries = entries.len(), "Opened directory");
                let handle = self.insert_handle(Handle::Dir(DirHandle {
                    path,
                    attrs: dir.to_attrs(),
                    pending: entries.into(),
                }));
                Response::Handle { id, handle }
            }
            Err(err) => self.reply_error(id, "opendir", &path, err),
        }
    }

    fn read_dir(&mut self, id: u32, handle: &[u8]) -> Response {
        let dir = match self.handles.get_mut(&handle_id(handle)) {
            Some(Handle::Dir(dir)) if handle.len() == 4 => dir,
            _ => return invalid_handle(id),
        };

        if dir.pending.is_empty() {
            return Response::status(id, StatusCode::Eof, "end of directory");
        }

        let take = dir.pending.len().min(READDIR_BATCH);
        let entries = dir
            .pending
            .drain(..take)
            .map(|entry| NameEntry {
                longname: entry.longname(),
                attrs: entry.to_attrs(),
                filename: entry.name,
            })
            .collect();
        Response::Name { id, entries }
    }

    fn insert_handle(&mut self, handle: Handle) -> Bytes {
        while self.handles.contains_key(&self.next_handle) {
            self.next_handle = self.next_handle.wrapping_add(1);
        }
        let key = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(key, handle);
        Bytes::copy_from_slice(&key.to_be_bytes())
    }

    fn take_handle(&mut self, handle: &[u8]) -> Option<Handle> {
        if handle.len() != 4 {
            return None;
        }
        self.handles.remove(&handle_id(handle))
    }

    fn handle_path(&self, handle: &[u8]) -> String {
        self.handles
            .get(&handle_id(handle))
            .map(|h| h.path().to_string())
            .unwrap_or_default()
    }

    fn reply_ok(&self, id: u32, op: &str, path: &str, result: Result<(), JailError>) -> Response {
        match result {
            Ok(()) => Response::status(id, StatusCode::Ok, ""),
            Err(err) => self.reply_error(id, op, path, err),
        }
    }

    fn reply_error(&self, id: u32, op: &str, path: &str, err: JailError) -> Response {
        if err.is_denial() {
            warn!(peer = %self.peer, op, path, error = %err, "Request denied");
        } else {
            debug!(peer = %self.peer, op, path, error = %err, "Request failed");
        }
        Response::status(id, err.status_code(), err.peer_message())
    }
}

fn handle_id(handle: &[u8]) -> u32 {
    match <[u8; 4]>::try_from(handle) {
        Ok(raw) => u32::from_be_bytes(raw),
        Err(_) => u32::MAX,
    }
}

fn invalid_handle(id: u32) -> Response {
    Response::status(id, StatusCode::Failure, "invalid handle")
}

async fn run_blocking<T, F>(f: F) -> Result<T, JailError>
where
    F: FnOnce() -> Result<T, JailError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JailError::Io(std::io::Error::other(e)))?
}
