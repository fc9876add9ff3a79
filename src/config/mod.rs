//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay configuration
    pub relay: Option<RelayConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
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

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: None,
            client: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Tunnel-establishment listen address
    pub tunnel_listen: String,
    /// Public HTTP listen address
    pub public_listen: String,
    /// Accepted client auth tokens; empty means an open relay
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    /// TLS certificate path (enables TLS on both listeners)
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Maximum concurrent tunnel clients
    pub max_clients: usize,
    /// Locator written into registry entries; defaults to the public
    /// listen address
    pub locator: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: format!("0.0.0.0:{}", crate::DEFAULT_TUNNEL_PORT),
            public_listen: format!("0.0.0.0:{}", crate::DEFAULT_PUBLIC_PORT),
            auth_tokens: Vec::new(),
            tls_cert: None,
            tls_key: None,
            max_clients: 1024,
            locator: None,
        }
    }
}

impl RelayConfig {
    /// Effective locator for registry entries
    pub fn locator(&self) -> String {
        self.locator
            .clone()
            .unwrap_or_else(|| self.public_listen.clone())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay tunnel address
    pub relay_addr: String,
    /// Auth token presented in the handshake
    #[serde(default)]
    pub token: String,
    /// Local HTTP server to expose
    pub local_addr: String,
    /// CA bundle for a TLS relay dial
    pub tls_ca: Option<String>,
    /// Server name for TLS verification
    pub tls_server_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_addr: format!("127.0.0.1:{}", crate::DEFAULT_TUNNEL_PORT),
            token: String::new(),
            local_addr: "127.0.0.1:3000".to_string(),
            tls_ca: None,
            tls_server_name: None,
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

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        relay: Some(RelayConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}
