//! weblist daemon
//!
//! Read-only directory sharing over HTTP and SFTP.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use weblist_daemon::config::{default_config_path, Config};
use weblist_daemon::identity::HostIdentity;
use weblist_daemon::orchestrator::DaemonOrchestrator;

/// weblist - share a directory, read-only, over HTTP and SFTP.
#[derive(Parser, Debug)]
#[command(name = "weblist")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve the configured directory until interrupted
    Start,

    /// Load or create the SSH host key and print its fingerprint
    HostKey,

    /// Validate the configuration and print it with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    init_tracing(cli.verbose, &config.daemon.log_level);
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start => {
            config.validate()?;
            tracing::info!("weblist daemon starting...");

            let orchestrator = DaemonOrchestrator::new(config)?;
            orchestrator.start().await?;

            wait_for_shutdown_signal().await;
            tracing::info!("Received shutdown signal");

            orchestrator.stop().await?;
        }
        Commands::HostKey => {
            let identity = HostIdentity::load_or_generate(config.host_key_path());
            println!("Host key: {}", config.host_key_path().display());
            println!("Fingerprint: {}", identity.fingerprint());
            println!("{}", identity.public_key_line());
        }
        Commands::CheckConfig => {
            config.validate()?;
            let rendered = config
                .redacted()
                .to_toml()
                .context("Failed to render configuration")?;
            println!("# {}", config_path.display());
            print!("{}", rendered);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
fn init_tracing(verbose: bool, configured: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { configured };
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for a shutdown signal (SIGTERM or Ctrl-C).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::info!("Received SIGINT"),
        Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
    }
}
