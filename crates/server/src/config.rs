//! Configuration management for the PushConn server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pushconn/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::ServerOptions;
use crate::settings::{DEFAULT_COMPRESS_THRESHOLD, DEFAULT_DIGEST_THRESHOLD};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("listen_addr must be a socket address such as 0.0.0.0:8964, got {0}")]
    InvalidListenAddr(String),

    #[error("purge_interval_secs must be greater than 0, got {0}")]
    InvalidPurgeInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the PushConn server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and process configuration.
    pub server: ServerConfig,

    /// Defaults for every new connection.
    pub connection: ConnectionConfig,

    /// Message cache configuration.
    pub cache: CacheConfig,
}

/// Listener and process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept TCP connections on.
    pub listen_addr: String,

    /// Deadline for key exchange plus authentication, in seconds.
    pub handshake_timeout_secs: u64,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// File holding the server's static key.
    pub key_file: PathBuf,
}

/// Per-connection defaults. Clients may change them with a settings command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Messages larger than this are sent as digests. Negative disables.
    pub digest_threshold: i32,

    /// Frames for messages larger than this are compressed. Non-positive disables.
    pub compress_threshold: i32,
}

/// Message cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How often expired entries are swept, in seconds.
    pub purge_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8964".to_string(),
            handshake_timeout_secs: 10,
            log_level: "info".to_string(),
            key_file: default_data_dir().join("server.key"),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            digest_threshold: DEFAULT_DIGEST_THRESHOLD,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pushconn")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pushconn")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PUSHCONN_LISTEN_ADDR: Override the listen address
    /// - PUSHCONN_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PUSHCONN_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("PUSHCONN_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.server.handshake_timeout_secs;
        if !(1..=300).contains(&timeout) {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        if self.cache.purge_interval_secs == 0 {
            return Err(ConfigError::InvalidPurgeInterval(
                self.cache.purge_interval_secs,
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Server tunables derived from this configuration.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            digest_threshold: self.connection.digest_threshold,
            compress_threshold: self.connection.compress_threshold,
        }
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
