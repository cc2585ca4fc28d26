//! Configuration management
//!
//! One JSON file configures both roles: a process runs as server, client,
//! or both depending on which top-level blocks are present. The client
//! block doubles as the wire payload of the `START` handshake frame, so
//! its field names are part of the protocol.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shared secret clients must present
    pub key: String,
    /// Control port to listen on
    pub port: u16,
    /// Allowed outer-port range, as a `[min, max]` pair. Any other shape
    /// leaves port requests unconstrained.
    #[serde(rename = "-limit-port", default, skip_serializing_if = "Vec::is_empty")]
    pub limit_port: Vec<u16>,
}

impl ServerConfig {
    /// The outer-port range clients may claim, if one is configured.
    ///
    /// Only a well-formed pair counts: exactly two values with
    /// `min <= max`. Anything else means no constraint.
    pub fn limit_range(&self) -> Option<(u16, u16)> {
        match self.limit_port[..] {
            [min, max] if min <= max => Some((min, max)),
            _ => None,
        }
    }
}

/// Client configuration; serialized as-is into the `START` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Shared secret presented to the server
    pub key: String,
    /// Server control address, `host:port`
    pub server: String,
    /// Port mappings to establish
    #[serde(default)]
    pub map: Vec<Mapping>,
}

/// One port mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    /// Target address reachable from the client's network, `host:port`
    pub inner: String,
    /// Port to expose on the server
    pub outer: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
