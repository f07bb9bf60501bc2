//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server endpoint configuration
    pub server: Option<ServerConfig>,
    /// Client endpoint configuration
    pub client: Option<ClientConfig>,
    /// Tunnel protocol configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the main channel listens on
    pub listen: String,
    /// Target address dialed for each opened sub-connection
    pub target: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8555".to_string(),
            target: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Client endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server main-channel address
    pub server: String,
    /// Local address accepting user connections
    pub listen: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8555".to_string(),
            listen: "127.0.0.1:1080".to_string(),
        }
    }
}

/// Tunnel protocol configuration
///
/// All durations are seconds. Queue depths are counted in frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Maximum serialized frame length in bytes
    pub max_msg_size: usize,
    /// Main channel outbound queue depth
    pub main_buffer: usize,
    /// Per sub-connection queue depth
    pub conn_buffer: usize,
    /// Seconds a record may stay unestablished
    pub established_timeout: u64,
    /// Seconds between pings on the main channel
    pub ping_interval: u64,
    /// Unanswered pings that constitute a timeout
    pub ping_timeout_count: u32,
    /// Seconds a sub-connection may show zero activity
    pub conn_idle_timeout: u64,
    /// Seconds to wait when dialing the target
    pub connect_timeout: u64,
    /// Transport selector
    pub proto: String,
    /// Shared login key
    pub key: String,
    /// Payload cipher secret; empty disables encryption
    pub encrypt: String,
    /// Minimum payload length for compression; zero disables it
    pub compress: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_msg_size: 1024 * 1024,
            main_buffer: 1024 * 1024,
            conn_buffer: 1024,
            established_timeout: 10,
            ping_interval: 1,
            ping_timeout_count: 5,
            conn_idle_timeout: 300,
            connect_timeout: 10,
            proto: "tcp".to_string(),
            key: String::new(),
            encrypt: String::new(),
            compress: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
