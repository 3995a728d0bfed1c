//! Configuration module for the vsock-serve binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::server::ServerConfig;

/// Which dispatch convention the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    /// MessagePack envelope addressed by path.
    #[default]
    Path,
    /// Raw body addressed by the header code.
    Code,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "vsock-serve")]
#[command(version)]
#[command(about = "Length-prefixed binary protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Dispatch convention
    #[arg(long, value_enum)]
    pub convention: Option<Convention>,

    /// Per-request read timeout in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Per-reply write timeout in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Wait for the next request in milliseconds (0 = use the read timeout)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Close each connection after one exchange
    #[arg(long)]
    pub no_keep_alive: bool,

    /// Maximum concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub buffers: BufferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Dispatch convention
    #[serde(default)]
    pub convention: Convention,
    /// Serve more than one request per connection
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            convention: Convention::default(),
            keep_alive: default_keep_alive(),
            max_connections: default_max_connections(),
        }
    }
}

/// Deadlines in milliseconds; zero disables a deadline.
#[derive(Debug, Deserialize, Default)]
pub struct TimeoutSection {
    #[serde(default)]
    pub read_ms: u64,
    #[serde(default)]
    pub write_ms: u64,
    #[serde(default)]
    pub idle_ms: u64,
}

/// Buffer pool configuration
#[derive(Debug, Deserialize)]
pub struct BufferSection {
    /// Initial size of each pooled buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub size: usize,
    /// Idle buffers kept for reuse
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            size: default_buffer_size(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Largest accepted `buffers.size`.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

fn default_listen() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_keep_alive() -> bool {
    true
}

fn default_max_connections() -> usize {
    ServerConfig::default().max_connections
}

fn default_buffer_size() -> usize {
    ServerConfig::default().buffer_size
}

fn default_pool_capacity() -> usize {
    ServerConfig::default().pool_capacity
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub convention: Convention,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive: bool,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over file values (CLI takes precedence).
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let max_connections = cli.max_connections.unwrap_or(file.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        if max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid("max_connections is too large"));
        }
        if file.buffers.size == 0 {
            return Err(ConfigError::Invalid("buffers.size must be positive"));
        }
        if file.buffers.size > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid("buffers.size must not exceed 64 MiB"));
        }

        let millis = |flag: Option<u64>, value: u64| Duration::from_millis(flag.unwrap_or(value));

        Ok(Config {
            listen,
            convention: cli.convention.unwrap_or(file.server.convention),
            read_timeout: millis(cli.read_timeout_ms, file.timeouts.read_ms),
            write_timeout: millis(cli.write_timeout_ms, file.timeouts.write_ms),
            idle_timeout: millis(cli.idle_timeout_ms, file.timeouts.idle_ms),
            keep_alive: !cli.no_keep_alive && file.server.keep_alive,
            max_connections,
            buffer_size: file.buffers.size,
            pool_capacity: file.buffers.pool_capacity,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }

    /// Settings consumed by [`crate::server::Server`].
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            keep_alive: self.keep_alive,
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            pool_capacity: self.pool_capacity,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
