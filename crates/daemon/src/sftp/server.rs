//! SSH transport glue: accept loop, authentication and channel routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, SshId};
use russh_keys::key;
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::idle::IdleTimeoutStream;
use super::session::SftpSession;
use super::state::{ConnectionState, ConnectionTracker};
use super::SessionError;
use crate::auth::{CredentialGate, RateLimiter};
use crate::config::SftpConfig;
use crate::files::JailedFileSystem;
use crate::identity::HostIdentity;

/// The only subsystem served.
pub const SUBSYSTEM_NAME: &str = "sftp";

const INTERACTIVE_REFUSAL: &str = "This service only provides SFTP access.\r\n";

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct SftpContext {
    pub gate: Arc<CredentialGate>,
    pub limiter: Arc<RateLimiter>,
    pub jail: Arc<JailedFileSystem>,
}

/// The SSH front door.
pub struct SftpServer {
    ssh_config: Arc<russh::server::Config>,
    context: SftpContext,
    idle_timeout: Duration,
    max_auth_attempts: u32,
}

impl SftpServer {
    pub fn new(config: &SftpConfig, identity: &HostIdentity, context: SftpContext) -> Self {
        let methods = offered_methods(&context.gate);
        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(format!("SSH-2.0-{}", config.banner)),
            methods,
            keys: vec![identity.to_key_pair()],
            max_auth_attempts: config.max_auth_attempts as usize,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: None,
            ..Default::default()
        };

        Self {
            ssh_config: Arc::new(ssh_config),
            context,
            idle_timeout: config.idle_timeout(),
            max_auth_attempts: config.max_auth_attempts,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// A fresh handler for a connection from `peer`.
    pub fn handler(&self, peer: SocketAddr) -> SshSessionHandler {
        SshSessionHandler::new(peer, self.context.clone(), self.max_auth_attempts)
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Established connections are left to finish on their own.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("SFTP listening on {}", addr),
            Err(e) => warn!("SFTP listener address unavailable: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SFTP listener received shutdown signal");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_tcp(stream, peer).await;
                        });
                    }
                    Err(e) => warn!("Failed to accept SSH connection: {}", e),
                },
            }
        }
    }

    async fn handle_tcp(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        debug!(%peer, "SSH connection accepted");

        match self.run_connection(stream, peer).await {
            Ok(()) => debug!(%peer, "SSH connection closed"),
            Err(SessionError::TransportIdleTimeout) => {
                info!(%peer, "Closed idle SSH connection")
            }
            Err(SessionError::AuthenticationFailed) => {
                info!(%peer, "SSH client left without authenticating")
            }
            Err(e @ SessionError::TooManyAuthAttempts(_)) => {
                warn!(%peer, "SSH connection dropped: {}", e)
            }
            Err(e) => debug!(%peer, "SSH connection ended: {}", e),
        }
    }

    /// Run one SSH connection over `stream` to completion.
    ///
    /// A connection that ends cleanly without ever authenticating yields
    /// [`SessionError::AuthenticationFailed`].
    pub async fn run_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream = IdleTimeoutStream::new(stream, self.idle_timeout);
        let handler = self.handler(peer);
        let authenticated = Arc::clone(&handler.authenticated);

        let session = russh::server::run_stream(Arc::clone(&self.ssh_config), stream, handler)
            .await
            .map_err(classify)?;
        session.await.map_err(classify)?;

        if authenticated.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SessionError::AuthenticationFailed)
        }
    }
}

fn offered_methods(gate: &CredentialGate) -> MethodSet {
    let mut methods = MethodSet::empty();
    if gate.accepts_password() {
        methods |= MethodSet::PASSWORD;
    }
    if gate.accepts_public_keys() {
        methods |= MethodSet::PUBLICKEY;
    }
    methods
}

fn classify(err: anyhow::Error) -> SessionError {
    let err = match err.downcast::<SessionError>() {
        Ok(session_err) => return session_err,
        Err(err) => err,
    };

    let timed_out = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == std::io::ErrorKind::TimedOut)
    });
    if timed_out {
        SessionError::TransportIdleTimeout
    } else {
        SessionError::Transport(format!("{:#}", err))
    }
}

/// Per-connection SSH handler.
pub struct SshSessionHandler {
    peer: SocketAddr,
    source: String,
    context: SftpContext,
    tracker: ConnectionTracker,
    authenticated: Arc<AtomicBool>,
    pending: HashMap<ChannelId, Channel<Msg>>,
}

impl SshSessionHandler {
    pub fn new(peer: SocketAddr, context: SftpContext, max_auth_attempts: u32) -> Self {
        Self {
            peer,
            source: peer.ip().to_string(),
            context,
            tracker: ConnectionTracker::new(peer, max_auth_attempts),
            authenticated: Arc::new(AtomicBool::new(false)),
            pending: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    fn rejection(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(offered_methods(&self.context.gate)),
        }
    }

    fn accept(&mut self, user: &str, method: &str) -> Result<Auth, anyhow::Error> {
        self.tracker.transition(ConnectionState::Authenticated)?;
        self.authenticated.store(true, Ordering::Release);
        info!(
            peer = %self.peer,
            user,
            method,
            attempts = self.tracker.auth_attempts(),
            "SSH client authenticated"
        );
        Ok(Auth::Accept)
    }

    /// Session channels are only opened once a credential was accepted.
    fn is_authenticated(&self) -> bool {
        matches!(
            self.tracker.state(),
            ConnectionState::Authenticated | ConnectionState::SessionActive
        )
    }

    fn refuse_interactive(&mut self, channel_id: ChannelId, kind: &str, session: &mut Session) {
        info!(peer = %self.peer, kind, "Interactive access refused");
        self.pending.remove(&channel_id);
        session.channel_success(channel_id);
        session.data(channel_id, CryptoVec::from_slice(INTERACTIVE_REFUSAL.as_bytes()));
        session.exit_status_request(channel_id, 1);
        session.eof(channel_id);
        session.close(channel_id);
    }
}

impl Drop for SshSessionHandler {
    fn drop(&mut self) {
        self.tracker.close();
    }
}

#[async_trait]
impl Handler for SshSessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.tracker.begin_auth_attempt()?;

        if !self.context.gate.accepts_password() {
            return Ok(self.rejection());
        }
        if !self.context.limiter.admit(&self.source).await {
            return Ok(self.rejection());
        }

        if self.context.gate.verify(user, password) {
            self.context.limiter.reset(&self.source);
            self.accept(user, "password")
        } else {
            warn!(
                peer = %self.peer,
                user,
                attempt = self.tracker.auth_attempts(),
                "SSH password authentication failed"
            );
            Ok(self.rejection())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.tracker.begin_auth_attempt()?;

        let blob = public_key.public_key_bytes();
        if self.context.gate.verify_public_key(user, &blob) {
            self.accept(user, "publickey")
        } else {
            debug!(peer = %self.peer, user, "SSH public key not authorized");
            Ok(self.rejection())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.is_authenticated() {
            return Ok(false);
        }
        debug!(peer = %self.peer, channel = ?channel.id(), "Session channel opened");
        self.pending.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != SUBSYSTEM_NAME {
            warn!(peer = %self.peer, subsystem = name, "Unsupported subsystem requested");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let Some(channel) = self.pending.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        self.tracker.transition(ConnectionState::SessionActive)?;
        session.channel_success(channel_id);

        let sftp = SftpSession::new(Arc::clone(&self.context.jail)).with_peer(self.peer.to_string());
        let peer = self.peer;
        tokio::spawn(async move {
            if let Err(e) = sftp.serve(Box::pin(channel.into_stream())).await {
                debug!(%peer, "SFTP channel ended: {}", e);
            }
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_interactive(channel_id, "shell", session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_interactive(channel_id, "exec", session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pending.remove(&channel_id);
        Ok(())
    }
}
