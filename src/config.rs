//! Configuration module for the drop-box server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default host the server binds to and the client connects to.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port of the upload service.
pub const DEFAULT_PORT: u16 = 7777;

/// Command-line arguments for the upload server
#[derive(Parser, Debug, Default)]
#[command(name = "drop-box")]
#[command(author = "drop-box authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol file upload server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory uploaded files are written to (bytes are discarded if unset)
    #[arg(short = 'd', long)]
    pub upload_dir: Option<PathBuf>,

    /// What happens to open sessions when the server is asked to stop
    #[arg(long, value_enum)]
    pub shutdown_policy: Option<ShutdownPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Handling of sessions that are still open when shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Stop accepting, let open sessions log out or disconnect on their own.
    #[default]
    Drain,
    /// Stop accepting and close every open session immediately.
    Force,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of simultaneous sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Size of a single socket read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Longest accepted message line, terminator excluded
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Upper bound on a single readiness wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Number of readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            max_line_length: default_max_line_length(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Upload storage configuration
#[derive(Debug, Deserialize, Default)]
pub struct UploadConfig {
    pub dir: Option<PathBuf>,
}

/// Shutdown configuration
#[derive(Debug, Deserialize, Default)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub policy: ShutdownPolicy,
    /// Seconds to wait for sessions to drain before closing them (unset = forever)
    pub drain_timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_line_length() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_events_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_line_length: usize,
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub upload_dir: Option<PathBuf>,
    pub shutdown_policy: ShutdownPolicy,
    pub drain_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed CLI arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            max_connections: server.max_connections,
            buffer_size: server.buffer_size.max(1),
            max_line_length: server.max_line_length,
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            events_capacity: server.events_capacity.max(1),
            upload_dir: cli.upload_dir.or(toml_config.upload.dir),
            shutdown_policy: cli
                .shutdown_policy
                .unwrap_or(toml_config.shutdown.policy),
            drain_timeout: toml_config
                .shutdown
                .drain_timeout_secs
                .map(Duration::from_secs),
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Resolve `host:port` to the first socket address it names.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(target.clone(), e))?
            .next()
            .ok_or_else(|| {
                ConfigError::Resolve(
                    target.clone(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
                )
            })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Failed to resolve address '{0}': {1}")]
    Resolve(String, #[source] std::io::Error),
}
