//! Configuration management for the weblist daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/weblist/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("auth.username must not be empty")]
    EmptyUsername,

    #[error("either auth.password or auth.authorized_keys must be configured")]
    NoCredentials,

    #[error("auth.session_ttl_secs must be greater than 0")]
    InvalidSessionTtl,

    #[error("rate_limit.max_attempts must be greater than 0")]
    InvalidMaxAttempts,

    #[error("rate_limit.window_secs must be greater than 0")]
    InvalidWindow,

    #[error("sftp.idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("sftp.max_auth_attempts must be greater than 0")]
    InvalidMaxAuthAttempts,

    #[error("{section}.listen is not a valid socket address: {value}")]
    InvalidListenAddress { section: &'static str, value: String },

    #[error("web.login_path must start with '/' and not clash with other routes, got {0}")]
    InvalidLoginPath(String),

    #[error("at least one of web.enabled and sftp.enabled must be true")]
    NothingEnabled,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Placeholder written in place of secrets by [`Config::redacted`].
const REDACTED: &str = "<redacted>";

/// Main configuration structure for the weblist daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// The single configured principal and session settings.
    pub auth: AuthConfig,

    /// Shared directory settings.
    pub files: FilesConfig,

    /// Web front door.
    pub web: WebConfig,

    /// SFTP front door.
    pub sftp: SftpConfig,

    /// Login throttling, shared by both front doors.
    pub rate_limit: RateLimitConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (host key).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Login name of the single principal.
    pub username: String,

    /// Password of the principal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// OpenSSH authorized_keys file accepted by the SFTP door.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_keys: Option<PathBuf>,

    /// HMAC secret for session tokens. Random per process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,

    /// Session token lifetime in seconds.
    pub session_ttl_secs: u64,
}

/// Shared directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Root of the shared tree.
    pub root: PathBuf,

    /// Exclusion patterns (exact path, any component, or path suffix).
    pub exclude: Vec<String>,

    /// Files smaller than this are served from memory (default: 10MB).
    pub memory_read_threshold: u64,
}

/// Web front door configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub listen: String,
    pub login_path: String,
}

/// SFTP front door configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SftpConfig {
    pub enabled: bool,

    pub listen: String,

    /// Host key location. Defaults to `<data_dir>/ssh_host_ed25519_key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<PathBuf>,

    /// Seconds without transport activity before a connection is dropped.
    pub idle_timeout_secs: u64,

    /// Hard ceiling on authentication attempts per connection.
    pub max_auth_attempts: u32,

    /// Suffix of the SSH version banner (`SSH-2.0-<banner>`).
    pub banner: String,
}

/// Attempt throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Attempts admitted per source within one window.
    pub max_attempts: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Artificial delay applied to denied attempts, in milliseconds.
    pub denial_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "weblist".to_string(),
            password: None,
            authorized_keys: None,
            session_secret: None,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            exclude: Vec::new(),
            memory_read_threshold: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8080".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:2222".to_string(),
            host_key_path: None,
            idle_timeout_secs: 600, // 10 minutes
            max_auth_attempts: 6,
            banner: "weblist".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 600, // 10 minutes
            denial_delay_ms: 1000,
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl SftpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn denial_delay(&self) -> Duration {
        Duration::from_millis(self.denial_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("weblist")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("weblist")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WEBLIST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WEBLIST_PASSWORD: Override the principal's password
    /// - WEBLIST_SESSION_SECRET: Override the session token secret
    /// - WEBLIST_ROOT: Override the shared root directory
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("WEBLIST_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(password) = non_empty_env("WEBLIST_PASSWORD") {
            tracing::info!("Overriding password from environment");
            self.auth.password = Some(password);
        }

        if let Some(secret) = non_empty_env("WEBLIST_SESSION_SECRET") {
            tracing::info!("Overriding session_secret from environment");
            self.auth.session_secret = Some(secret);
        }

        if let Some(root) = non_empty_env("WEBLIST_ROOT") {
            tracing::info!("Overriding files.root from environment: {}", root);
            self.files.root = PathBuf::from(root);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }

        let has_password = self.auth.password.as_deref().is_some_and(|p| !p.is_empty());
        if !has_password && self.auth.authorized_keys.is_none() {
            return Err(ConfigError::NoCredentials);
        }

        if self.auth.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidSessionTtl);
        }

        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }

        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::InvalidWindow);
        }

        if !self.web.enabled && !self.sftp.enabled {
            return Err(ConfigError::NothingEnabled);
        }

        if self.web.enabled {
            parse_listen("web", &self.web.listen)?;
            if !is_valid_login_path(&self.web.login_path) {
                return Err(ConfigError::InvalidLoginPath(self.web.login_path.clone()));
            }
        }

        if self.sftp.enabled {
            parse_listen("sftp", &self.sftp.listen)?;
            if self.sftp.idle_timeout_secs == 0 {
                return Err(ConfigError::InvalidIdleTimeout);
            }
            if self.sftp.max_auth_attempts == 0 {
                return Err(ConfigError::InvalidMaxAuthAttempts);
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Parsed web listen address.
    pub fn web_listen(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen("web", &self.web.listen)
    }

    /// Parsed SFTP listen address.
    pub fn sftp_listen(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen("sftp", &self.sftp.listen)
    }

    /// Effective host key path.
    pub fn host_key_path(&self) -> PathBuf {
        self.sftp
            .host_key_path
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("ssh_host_ed25519_key"))
    }

    /// A copy with every secret replaced by a placeholder, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.auth.password.is_some() {
            copy.auth.password = Some(REDACTED.to_string());
        }
        if copy.auth.session_secret.is_some() {
            copy.auth.session_secret = Some(REDACTED.to_string());
        }
        copy
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn is_valid_login_path(path: &str) -> bool {
    path.starts_with('/')
        && path != "/"
        && path != "/logout"
        && !path.starts_with("/api/")
        && !path.starts_with("/files/")
}

fn parse_listen(section: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidListenAddress {
            section,
            value: value.to_string(),
        })
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
