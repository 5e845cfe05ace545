//! Configuration module for chat-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Port used by both roles when nothing else is configured
pub const DEFAULT_PORT: u16 = 5555;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client chat relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub role: RoleArgs,
}

/// Which side of the relay to run
#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Accept clients and relay their messages
    Server {
        /// Port to listen on (falls back to the configured port if unparsable)
        port: Option<String>,

        /// Address to bind to (e.g., 0.0.0.0)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Maximum number of simultaneous connections
        #[arg(short = 'm', long)]
        max_connections: Option<usize>,
    },
    /// Connect to a server and chat
    Client {
        /// Name announced to the server on login
        login_id: String,

        /// Server host name or address
        host: String,

        /// Server port (falls back to the configured port if unparsable)
        port: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection table capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Port to connect to when none is given on the command line
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub port: u16,
    pub max_connections: usize,
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub login_id: String,
    pub host: String,
    pub port: u16,
}

/// Resolved role
#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerSettings),
    Client(ClientSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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
        let role = match cli.role {
            RoleArgs::Server {
                port,
                listen,
                max_connections,
            } => Role::Server(ServerSettings {
                listen: listen.unwrap_or(toml_config.server.listen),
                port: parse_port(port.as_deref(), toml_config.server.port),
                max_connections: max_connections.unwrap_or(toml_config.server.max_connections),
            }),
            RoleArgs::Client {
                login_id,
                host,
                port,
            } => Role::Client(ClientSettings {
                login_id,
                host,
                port: parse_port(port.as_deref(), toml_config.client.port),
            }),
        };

        Config {
            role,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Parse a port argument, keeping `fallback` when it is absent or not a port number.
pub fn parse_port(raw: Option<&str>, fallback: u16) -> u16 {
    raw.and_then(|p| p.trim().parse().ok()).unwrap_or(fallback)
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
