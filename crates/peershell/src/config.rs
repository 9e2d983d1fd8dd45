//! Configuration management for peershell.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peershell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use iroh::RelayUrl;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{HOST_KEY_FILE, NODE_KEY_FILE};
use crate::session::pty::default_login_argv;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("resize_poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("connect_timeout_secs must be greater than 0")]
    InvalidConnectTimeout,

    #[error("relay_url is not a valid URL: {0}")]
    InvalidRelayUrl(String),

    #[error("protocol_id must not be empty")]
    EmptyProtocolId,

    #[error("login_command must not be empty")]
    EmptyLoginCommand,

    #[error("login_command program does not exist: {0}")]
    InvalidLoginProgram(String),

    #[error("max_auth_attempts must be between 1 and 100, got {0}")]
    InvalidMaxAuthAttempts(usize),

    #[error("at least one of password_auth and publickey_auth must be enabled")]
    NoAuthMethod,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for peershell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Data directory and logging.
    pub general: GeneralConfig,

    /// Transport configuration.
    pub network: NetworkConfig,

    /// Settings for `peershell serve`.
    pub server: ServerConfig,

    /// Settings for `peershell connect`.
    pub client: ClientConfig,
}

/// Data directory and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for keys.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also log to a daily-rotated file in the data directory.
    pub log_to_file: bool,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Relay server to use instead of the default relays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,

    /// Protocol identifier streams are opened under.
    pub protocol_id: String,

    /// Timeout for reaching a peer, in seconds.
    pub connect_timeout_secs: u64,
}

/// Settings for `peershell serve`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// SSH host key; defaults to `<data_dir>/ssh_host_ed25519_key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<PathBuf>,

    /// Shadow-style password file.
    pub shadow_path: PathBuf,

    /// Authorized keys location; `{user}` is replaced by the user name.
    pub authorized_keys_path: String,

    /// Login process argv; `{user}` is replaced by the user name.
    pub login_command: Vec<String>,

    /// Accept password authentication.
    pub password_auth: bool,

    /// Accept public-key authentication.
    pub publickey_auth: bool,

    /// Authentication attempts allowed per connection.
    pub max_auth_attempts: usize,

    /// Send the message of the day when a session starts.
    pub print_motd: bool,

    /// Message of the day file.
    pub motd_path: PathBuf,
}

/// Settings for `peershell connect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// User to log in as.
    pub user: String,

    /// Private key for public-key authentication. Without one the client
    /// asks for a password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Terminal type requested for the remote PTY.
    pub term: String,

    /// How often the local terminal size is checked, in milliseconds.
    pub resize_poll_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            protocol_id: protocol::PROTOCOL_ID.to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_key_path: None,
            shadow_path: PathBuf::from("/etc/shadow"),
            authorized_keys_path: "/home/{user}/.ssh/authorized_keys".to_string(),
            login_command: default_login_argv(),
            password_auth: true,
            publickey_auth: true,
            max_auth_attempts: 6,
            print_motd: false,
            motd_path: PathBuf::from("/etc/motd"),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            identity_file: None,
            term: protocol::DEFAULT_TERM.to_string(),
            resize_poll_interval_ms: 1,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peershell")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peershell")
}

/// The invoking user's name.
fn default_user() -> String {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "root".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PEERSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PEERSHELL_RELAY_URL: Override the relay server
    /// - PEERSHELL_USER: Override the user to log in as
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PEERSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }

        if let Ok(url) = std::env::var("PEERSHELL_RELAY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding relay_url from environment: {}", url);
                self.network.relay_url = Some(url);
            }
        }

        if let Ok(user) = std::env::var("PEERSHELL_USER") {
            if !user.is_empty() {
                tracing::info!("Overriding user from environment: {}", user);
                self.client.user = user;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_client()?;
        self.validate_server()
    }

    /// Validate everything `peershell connect` uses.
    pub fn validate_client(&self) -> Result<(), ConfigError> {
        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        let interval = self.client.resize_poll_interval_ms;
        if !(1..=1000).contains(&interval) {
            return Err(ConfigError::InvalidPollInterval(interval));
        }

        if self.network.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConnectTimeout);
        }

        if let Some(url) = &self.network.relay_url {
            if url.parse::<RelayUrl>().is_err() {
                return Err(ConfigError::InvalidRelayUrl(url.clone()));
            }
        }

        if self.network.protocol_id.is_empty() {
            return Err(ConfigError::EmptyProtocolId);
        }

        Ok(())
    }

    /// Validate the `[server]` section.
    pub fn validate_server(&self) -> Result<(), ConfigError> {
        let Some(program) = self.server.login_command.first() else {
            return Err(ConfigError::EmptyLoginCommand);
        };
        let program_path = Path::new(program);
        let found = if program_path.is_absolute() {
            program_path.exists()
        } else {
            which::which(program).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidLoginProgram(program.clone()));
        }

        if !(1..=100).contains(&self.server.max_auth_attempts) {
            return Err(ConfigError::InvalidMaxAuthAttempts(
                self.server.max_auth_attempts,
            ));
        }

        if !self.server.password_auth && !self.server.publickey_auth {
            return Err(ConfigError::NoAuthMethod);
        }

        Ok(())
    }

    /// The iroh node key file.
    pub fn node_key_path(&self) -> PathBuf {
        self.general.data_dir.join(NODE_KEY_FILE)
    }

    /// The SSH host key file.
    pub fn host_key_path(&self) -> PathBuf {
        self.server
            .host_key_path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join(HOST_KEY_FILE))
    }

    /// The relay server, if one is configured and valid.
    pub fn relay_url(&self) -> Option<RelayUrl> {
        self.network.relay_url.as_ref()?.parse().ok()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    pub fn resize_poll_interval(&self) -> Duration {
        Duration::from_millis(self.client.resize_poll_interval_ms)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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
