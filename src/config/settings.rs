//! Configuration settings for ballotd.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BallotError;

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Vote listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Address to listen on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on. A negative port disables the listener entirely;
    /// the daemon then acts only as a forwarding consumer.
    #[serde(default = "default_port")]
    pub port: i32,
    /// Bounded wait for a peer to send its block or payload, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    /// Maximum concurrent connections.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    /// Maximum v2 frame payload size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Key material configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Directory holding the RSA keypair as two PEM files.
    #[serde(default = "default_key_directory")]
    pub directory: PathBuf,
    /// Site name -> shared token for the v2 protocol.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// How validated votes are relayed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMethod {
    /// No forwarding: votes stop at the local handler.
    None,
    /// In-process named channel. Only reaches consumers that subscribe to
    /// the same `InProcessBroker` through the library API; the standalone
    /// daemon has no second in-process consumer, so cross-host deployments
    /// use `redis` instead.
    Channel,
    /// Redis pub/sub, for consumers on other hosts.
    Redis,
}

/// Which side of the relay this instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingRole {
    /// Votes decoded here are pushed to the transport.
    Source,
    /// Forwarded votes are consumed from the transport.
    Sink,
}

/// Forwarding relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_forwarding_method")]
    pub method: ForwardingMethod,
    #[serde(default = "default_forwarding_role")]
    pub role: ForwardingRole,
    /// Channel name shared by source and sink.
    #[serde(default = "default_forwarding_channel")]
    pub channel: String,
    /// Backend target names a source publishes to (channel method only;
    /// the redis method has one logical target, the channel itself).
    #[serde(default)]
    pub targets: Vec<String>,
    /// Messages per second when flushing a backend's cached votes after it
    /// reconnects.
    #[serde(default = "default_dump_rate")]
    pub dump_rate: usize,
    /// Maximum queued messages per backend before drop-oldest eviction.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// How often to probe a lost broker connection, in seconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional log file; receives a plain (ANSI-free) copy of the stream.
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> i32 {
    8192
}

fn default_read_timeout() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    100
}

fn default_max_frame_size() -> usize {
    8192
}

fn default_key_directory() -> PathBuf {
    PathBuf::from("/etc/ballotd/keys")
}

fn default_forwarding_method() -> ForwardingMethod {
    ForwardingMethod::None
}

fn default_forwarding_role() -> ForwardingRole {
    ForwardingRole::Source
}

fn default_forwarding_channel() -> String {
    "ballotd:votes".to_string()
}

fn default_dump_rate() -> usize {
    5
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_seconds: default_read_timeout(),
            max_concurrent_connections: default_max_concurrent(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            directory: default_key_directory(),
            tokens: HashMap::new(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            method: default_forwarding_method(),
            role: default_forwarding_role(),
            channel: default_forwarding_channel(),
            targets: Vec::new(),
            dump_rate: default_dump_rate(),
            cache_capacity: default_cache_capacity(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            reconnect_interval_seconds: default_reconnect_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BallotError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| BallotError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        let settings: Settings = toml::from_str(&content).map_err(|e| BallotError::Config {
            message: format!("Failed to parse config file '{}': {}", path.display(), e),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), BallotError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(BallotError::Config {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(BallotError::Config {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        if self.listener.port > u16::MAX as i32 {
            return Err(BallotError::Config {
                message: format!("Invalid listener port {}", self.listener.port),
            });
        }

        if self.forwarding.dump_rate == 0 {
            return Err(BallotError::Config {
                message: "forwarding.dump_rate must be at least 1".to_string(),
            });
        }

        if self.forwarding.cache_capacity == 0 {
            return Err(BallotError::Config {
                message: "forwarding.cache_capacity must be at least 1".to_string(),
            });
        }

        if self.forwarding.method == ForwardingMethod::Channel
            && self.forwarding.role == ForwardingRole::Source
            && self.forwarding.targets.is_empty()
        {
            return Err(BallotError::Config {
                message: "forwarding.targets must name at least one backend for the channel method"
                    .to_string(),
            });
        }

        Ok(())
    }
}
