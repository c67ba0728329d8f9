//! Configuration module for the quorum-gate front-end.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How long one poll pass may wait before the reactor re-checks control
/// state.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Size of the reactor's write-staging buffer shared across connections.
pub const WRITE_STAGING_SIZE: usize = 64 * 1024;

/// Command-line arguments for the front-end
#[derive(Parser, Debug)]
#[command(name = "quorum-gate")]
#[command(version)]
#[command(about = "Client-facing network front-end of a coordination service", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:2181)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum simultaneous connections per client IP (0 = unlimited)
    #[arg(short = 'c', long)]
    pub max_client_cnxns: Option<u32>,

    /// Maximum frame payload size in bytes
    #[arg(long)]
    pub max_frame: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum simultaneous connections per client IP
    #[serde(default = "default_max_client_cnxns")]
    pub max_client_cnxns: u32,
    /// Maximum frame payload size in bytes
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_client_cnxns: default_max_client_cnxns(),
            max_frame: default_max_frame(),
        }
    }
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

fn default_listen() -> String {
    "0.0.0.0:2181".to_string()
}

fn default_max_client_cnxns() -> u32 {
    10
}

fn default_max_frame() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_client_cnxns: u32,
    pub max_frame: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path).map_err(|e| ConfigError::File {
                path: config_path.clone(),
                source: e,
            })?;
            toml::from_str(&contents).map_err(|e| ConfigError::Toml {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let (host, port) = split_listen_addr(&listen)?;

        Ok(Config {
            host,
            port,
            max_client_cnxns: cli
                .max_client_cnxns
                .unwrap_or(toml_config.server.max_client_cnxns),
            max_frame: cli.max_frame.unwrap_or(toml_config.server.max_frame),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Split a `host:port` listen string. The host part must be non-empty.
fn split_listen_addr(addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = match addr.rsplit_once(':') {
        Some(parts) => parts,
        None => return Err(ConfigError::Listen(addr.to_string())),
    };
    match port.parse() {
        Ok(port) if !host.is_empty() => Ok((host.to_string(), port)),
        _ => Err(ConfigError::Listen(addr.to_string())),
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    Listen(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::File { path, .. } => {
                write!(f, "cannot read config file {}", path.display())
            }
            ConfigError::Toml { path, .. } => {
                write!(f, "config file {} is not valid TOML", path.display())
            }
            ConfigError::Listen(addr) => {
                write!(f, "listen address must be host:port, got '{addr}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::File { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Listen(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:2181");
        assert_eq!(config.server.max_client_cnxns, 10);
        assert_eq!(config.server.max_frame, 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:2181"
            max_client_cnxns = 60
            max_frame = 4194304

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:2181");
        assert_eq!(config.server.max_client_cnxns, 60);
        assert_eq!(config.server.max_frame, 4194304);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_split_listen_addr() {
        assert_eq!(
            split_listen_addr("0.0.0.0:2181").unwrap(),
            ("0.0.0.0".to_string(), 2181)
        );
        assert!(split_listen_addr("no-port").is_err());
        assert!(split_listen_addr("host:notaport").is_err());
        assert!(split_listen_addr(":2181").is_err());
    }
}
