//! Engine configuration.
//!
//! Layered configuration with the following priority (highest first):
//! 1. Values set programmatically on [`SyncConfig`]
//! 2. TOML config file (`~/.config/chatloop/config.toml`)
//! 3. Compiled defaults
//!
//! A missing default config file is not an error (defaults are used). An
//! explicit path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chatloop_proto::message::ConversationId;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A configured URL could not be parsed.
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
        /// Underlying parse error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    upload: UploadFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    api_url: Option<String>,
    channel_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[upload]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UploadFileConfig {
    max_files: Option<usize>,
    max_file_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts. `None` retries
    /// indefinitely, which matches the reference behavior; hosts that treat
    /// a permanently revoked session as fatal should set a cap.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: None,
        }
    }
}

/// Attachment upload limits.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum files per batch.
    pub max_files: usize,
    /// Maximum size per file in bytes.
    pub max_file_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST backend (e.g. `http://127.0.0.1:8000`).
    pub api_url: String,
    /// Base URL of the real-time channel (e.g. `ws://127.0.0.1:8000`).
    pub channel_url: String,
    /// Timeout for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Bound on waiting for a query response. Generation can be slow, hence
    /// the generous default.
    pub query_timeout: Duration,
    /// Interval between heartbeat pings on an open channel.
    pub heartbeat: Duration,
    /// Buffer size for typing/generic event channels.
    pub event_buffer: usize,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectConfig,
    /// Attachment upload limits.
    pub upload: UploadConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".to_string(),
            channel_url: "ws://127.0.0.1:8000".to_string(),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(300),
            heartbeat: Duration::from_secs(30),
            event_buffer: 64,
            reconnect: ReconnectConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration by merging a TOML file over compiled defaults.
    ///
    /// If `path` is given, the file must exist. If not, the default path
    /// (`~/.config/chatloop/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read or
    /// any config file cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = load_config_file(path)?;
        Ok(Self::resolve(&file))
    }

    /// Resolve a `SyncConfig` from a parsed config file.
    ///
    /// Separated from `load()` to enable unit testing without touching the
    /// filesystem.
    #[must_use]
    fn resolve(file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_url: file
                .network
                .api_url
                .clone()
                .unwrap_or(defaults.api_url),
            channel_url: file
                .network
                .channel_url
                .clone()
                .unwrap_or(defaults.channel_url),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            query_timeout: file
                .network
                .query_timeout_secs
                .map_or(defaults.query_timeout, Duration::from_secs),
            heartbeat: file
                .network
                .heartbeat_secs
                .map_or(defaults.heartbeat, Duration::from_secs),
            event_buffer: file
                .network
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            reconnect: ReconnectConfig {
                base_delay: file
                    .reconnect
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: file.reconnect.max_attempts,
            },
            upload: UploadConfig {
                max_files: file
                    .upload
                    .max_files
                    .unwrap_or(defaults.upload.max_files),
                max_file_bytes: file
                    .upload
                    .max_file_bytes
                    .unwrap_or(defaults.upload.max_file_bytes),
            },
        }
    }

    /// URL of the query endpoint.
    #[must_use]
    pub fn query_url(&self) -> String {
        format!("{}/query", self.api_url.trim_end_matches('/'))
    }

    /// URL of the upload endpoint.
    #[must_use]
    pub fn upload_url(&self) -> String {
        format!("{}/upload", self.api_url.trim_end_matches('/'))
    }

    /// URL of the token refresh endpoint.
    #[must_use]
    pub fn refresh_url(&self) -> String {
        format!("{}/token/refresh", self.api_url.trim_end_matches('/'))
    }

    /// URL of the real-time channel for a conversation (or the
    /// conversation-less default), with the access token attached.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if the configured channel base
    /// URL does not parse.
    pub fn channel_endpoint(
        &self,
        conversation: Option<&ConversationId>,
        token: &str,
    ) -> Result<url::Url, ConfigError> {
        let mut url =
            url::Url::parse(&self.channel_url).map_err(|source| ConfigError::InvalidUrl {
                url: self.channel_url.clone(),
                source,
            })?;
        let path = match conversation {
            Some(id) => format!("/channel/chat/{id}"),
            None => "/channel/chat".to_string(),
        };
        url.set_path(&path);
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let default_path = config_dir.join("chatloop").join("config.toml");
    match std::fs::read_to_string(&default_path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(_) => Ok(ConfigFile::default()),
    }
}
