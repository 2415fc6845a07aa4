//! Configuration.
//!
//! Supports command-line arguments and an optional TOML file; CLI values
//! take precedence. Defaults reproduce the server's native constants: port
//! 6379, a 64-entry submission ring, and 1024 receive buffers of 512 bytes.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "uringkv")]
#[command(about = "An in-memory RESP key-value server on io_uring", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Submission queue depth.
    #[serde(default = "default_sq_entries")]
    pub sq_entries: u32,
    /// Number of kernel-provided receive buffers (power of two).
    #[serde(default = "default_recv_buffers")]
    pub recv_buffers: u16,
    /// Size of each receive buffer in bytes.
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sq_entries: default_sq_entries(),
            recv_buffers: default_recv_buffers(),
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_port() -> u16 {
    6379
}

fn default_sq_entries() -> u32 {
    64
}

fn default_recv_buffers() -> u16 {
    1024
}

fn default_recv_buffer_size() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sq_entries: u32,
    pub recv_buffers: u16,
    pub recv_buffer_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            sq_entries: default_sq_entries(),
            recv_buffers: default_recv_buffers(),
            recv_buffer_size: default_recv_buffer_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file.
    /// CLI arguments take precedence over file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Ok(Config {
            port: cli.port.unwrap_or(toml_config.server.port),
            sq_entries: toml_config.engine.sq_entries,
            recv_buffers: toml_config.engine.recv_buffers,
            recv_buffer_size: toml_config.engine.recv_buffer_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_native_constants() {
        let config = Config::default();
        assert_eq!(config.port, 6379);
        assert_eq!(config.sq_entries, 64);
        assert_eq!(config.recv_buffers, 1024);
        assert_eq!(config.recv_buffer_size, 512);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [server]
            port = 7000

            [engine]
            sq_entries = 128
            recv_buffers = 256

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.engine.sq_entries, 128);
        assert_eq!(config.engine.recv_buffers, 256);
        // Unspecified fields keep their defaults.
        assert_eq!(config.engine.recv_buffer_size, 512);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 6379);
        assert_eq!(config.engine.sq_entries, 64);
    }
}
