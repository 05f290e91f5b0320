//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the shared
//! security components once (host identity, credential gate, rate limiter,
//! jailed filesystem) and runs both front doors on top of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{CredentialGate, RateLimiter};
use crate::config::Config;
use crate::files::{ExclusionSet, JailedFileSystem};
use crate::identity::HostIdentity;
use crate::sftp::{SftpContext, SftpServer};
use crate::web::{self, WebState};

/// Interval between sweeps of stale rate-limit records.
const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on waiting for listener tasks during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Daemon orchestrator that manages both front doors.
pub struct DaemonOrchestrator {
    /// Validated configuration.
    config: Config,
    /// SSH host key, immutable after startup.
    identity: HostIdentity,
    /// Shared credential checks and token issuing.
    gate: Arc<CredentialGate>,
    /// Attempt throttling shared by both doors.
    limiter: Arc<RateLimiter>,
    /// The shared tree.
    jail: Arc<JailedFileSystem>,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Addresses actually bound, once started.
    web_addr: RwLock<Option<SocketAddr>>,
    sftp_addr: RwLock<Option<SocketAddr>>,
    /// Background tasks to await on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for the current run. Replaced when a start follows
    /// a cancellation.
    shutdown_token: Mutex<CancellationToken>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let identity = HostIdentity::load_or_generate(config.host_key_path());
        info!("Host key fingerprint: {}", identity.fingerprint());

        let gate = Arc::new(CredentialGate::from_config(&config.auth)?);
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

        let exclusions = ExclusionSet::new(&config.files.exclude);
        let jail = JailedFileSystem::new(&config.files.root, exclusions)
            .with_context(|| {
                format!(
                    "Failed to open shared root: {}",
                    config.files.root.display()
                )
            })?
            .with_memory_threshold(config.files.memory_read_threshold);
        info!("Sharing {} (read-only)", jail.root().display());

        Ok(Self {
            config,
            identity,
            gate,
            limiter,
            jail: Arc::new(jail),
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            web_addr: RwLock::new(None),
            sftp_addr: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: Mutex::new(CancellationToken::new()),
        })
    }

    /// Returns the host key fingerprint.
    pub fn host_fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Bound web address, once started.
    pub async fn web_addr(&self) -> Option<SocketAddr> {
        *self.web_addr.read().await
    }

    /// Bound SFTP address, once started.
    pub async fn sftp_addr(&self) -> Option<SocketAddr> {
        *self.sftp_addr.read().await
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Bind the enabled front doors and start serving.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        let token = {
            let mut current = self.shutdown_token.lock().await;
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        if let Err(e) = self.spawn_front_doors(&token).await {
            warn!("Startup failed, releasing listeners: {:#}", e);
            token.cancel();
            self.join_tasks().await;
            *self.web_addr.write().await = None;
            *self.sftp_addr.write().await = None;
            *self.state.write().await = OrchestratorState::Stopped;
            return Err(e);
        }

        let limiter = Arc::clone(&self.limiter);
        self.tasks
            .lock()
            .await
            .push(tokio::spawn(prune_loop(limiter, token)));

        *self.state.write().await = OrchestratorState::Running;
        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn spawn_front_doors(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        if self.config.web.enabled {
            let addr = self.config.web_listen()?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind web listener on {}", addr))?;
            *self.web_addr.write().await = listener.local_addr().ok();

            let state = WebState::new(
                Arc::clone(&self.gate),
                Arc::clone(&self.limiter),
                Arc::clone(&self.jail),
                &self.config.web.login_path,
            );
            let app = web::router(state);
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = web::serve(listener, app, token).await {
                    warn!("Web interface failed: {}", e);
                }
            }));
        }

        if self.config.sftp.enabled {
            let addr = self.config.sftp_listen()?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind SFTP listener on {}", addr))?;
            *self.sftp_addr.write().await = listener.local_addr().ok();

            let context = SftpContext {
                gate: Arc::clone(&self.gate),
                limiter: Arc::clone(&self.limiter),
                jail: Arc::clone(&self.jail),
            };
            let server = Arc::new(SftpServer::new(&self.config.sftp, &self.identity, context));
            let token = shutdown.clone();
            tasks.push(tokio::spawn(server.serve(listener, token)));
        }

        Ok(())
    }

    /// Stops accepting connections.
    ///
    /// Established SFTP sessions are left to finish or idle out.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.lock().await.cancel();
        self.join_tasks().await;

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Await background tasks after their token was cancelled.
    async fn join_tasks(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop within {:?}", SHUTDOWN_GRACE),
            }
        }
    }

    /// Returns the token of the current run for external tasks to observe shutdown.
    pub async fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.lock().await.clone()
    }
}

async fn prune_loop(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = limiter.prune();
                if removed > 0 {
                    debug!(removed, "Pruned stale rate-limit records");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let share = temp_dir.path().join("share");
        std::fs::create_dir_all(&share).unwrap();
        std::fs::write(share.join("file.txt"), b"contents").unwrap();

        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().join("data");
        config.files.root = share;
        config.auth.password = Some("testpassword".to_string());
        config.web.listen = "127.0.0.1:0".to_string();
        config.sftp.listen = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.host_fingerprint().starts_with("SHA256:"));
    }

    #[tokio::test]
    async fn test_host_key_persists_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let first = DaemonOrchestrator::new(config.clone()).unwrap();
        let second = DaemonOrchestrator::new(config.clone()).unwrap();
        assert_eq!(first.host_fingerprint(), second.host_fingerprint());
        assert!(config.host_key_path().exists());
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.files.root = temp_dir.path().join("missing");

        let err = DaemonOrchestrator::new(config).err().unwrap();
        assert!(err.to_string().contains("Failed to open shared root"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.auth.password = None;

        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let orchestrator = DaemonOrchestrator::new(config).unwrap();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let web_addr = orchestrator.web_addr().await.unwrap();
        let sftp_addr = orchestrator.sftp_addr().await.unwrap();
        assert_ne!(web_addr.port(), 0);
        assert_ne!(sftp_addr.port(), 0);

        // Both listeners accept connections.
        tokio::net::TcpStream::connect(web_addr).await.unwrap();
        tokio::net::TcpStream::connect(sftp_addr).await.unwrap();

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().await.is_cancelled());

        // Stopping twice is a no-op.
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_failed_start() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let sftp_addr = blocker.local_addr().unwrap();
        config.sftp.listen = sftp_addr.to_string();
        let orchestrator = DaemonOrchestrator::new(config).unwrap();

        // The web door binds, then the SFTP door cannot.
        let err = orchestrator.start().await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind SFTP listener"));
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.web_addr().await.is_none());
        assert!(orchestrator.shutdown_token().await.is_cancelled());

        drop(blocker);
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(!orchestrator.shutdown_token().await.is_cancelled());

        let mut ssh = tokio::net::TcpStream::connect(sftp_addr).await.unwrap();
        let mut banner = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut ssh, &mut banner)
            .await
            .unwrap();
        assert_eq!(&banner, b"SSH-2.0-");

        let web_addr = orchestrator.web_addr().await.unwrap();
        tokio::net::TcpStream::connect(web_addr).await.unwrap();

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_sftp_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.web.enabled = false;
        let orchestrator = DaemonOrchestrator::new(config).unwrap();

        orchestrator.start().await.unwrap();
        assert!(orchestrator.web_addr().await.is_none());
        assert!(orchestrator.sftp_addr().await.is_some());
        orchestrator.stop().await.unwrap();
    }
}
