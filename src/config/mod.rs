//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reactor configuration
    #[serde(default)]
    pub reactor: ReactorConfig,

    /// Speedtest server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Speedtest client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ProbeError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| ProbeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/netprobe/netprobe.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("netprobe").join("netprobe.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server settings
        if let Ok(address) = std::env::var("NETPROBE_SERVER_ADDRESS") {
            config.server.address = address;
        }
        if let Ok(port) = std::env::var("NETPROBE_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("NETPROBE_ONLY_AUTH") {
            if let Ok(val) = val.parse() {
                config.server.only_auth = val;
            }
        }
        if let Ok(path) = std::env::var("NETPROBE_DOWNLOAD_PATH") {
            config.server.path = Some(PathBuf::from(path));
        }

        // Client settings
        if let Ok(uri) = std::env::var("NETPROBE_URI") {
            config.client.uri = uri;
        }
        if let Ok(val) = std::env::var("NETPROBE_CONNECTIONS") {
            if let Ok(val) = val.parse() {
                config.client.connections = val;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(self, other: Self) -> Self {
        let server_default = ServerConfig::default();
        let client_default = ClientConfig::default();

        Self {
            reactor: other.reactor,
            server: ServerConfig {
                address: if other.server.address != server_default.address {
                    other.server.address
                } else {
                    self.server.address
                },
                port: if other.server.port != server_default.port {
                    other.server.port
                } else {
                    self.server.port
                },
                only_auth: other.server.only_auth || self.server.only_auth,
                path: other.server.path.or(self.server.path),
                ..other.server
            },
            client: ClientConfig {
                uri: if other.client.uri != client_default.uri {
                    other.client.uri
                } else {
                    self.client.uri
                },
                connections: if other.client.connections != client_default.connections {
                    other.client.connections
                } else {
                    self.client.connections
                },
                ..other.client
            },
        }
    }

    /// Check values that would make the agent misbehave
    pub fn validate(&self) -> Result<()> {
        if self.client.connections == 0 {
            return Err(ProbeError::Config(
                "client.connections must be at least 1".to_string(),
            ));
        }
        if self.reactor.max_wait_secs <= 0.0 {
            return Err(ProbeError::Config(
                "reactor.max_wait_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Upper bound on a single multiplexer wait, in seconds
    pub max_wait_secs: f64,

    /// Interval between I/O watchdog passes, in seconds
    pub watchdog_interval_secs: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 1.0,
            watchdog_interval_secs: 10,
        }
    }
}

impl ReactorConfig {
    /// Maximum wait as a `Duration`
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_secs.max(0.0))
    }

    /// Watchdog interval as a `Duration`
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

/// Speedtest server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,

    /// Port to listen on
    pub port: u16,

    /// Refuse test URIs to sessions that are not unchoked
    pub only_auth: bool,

    /// File served by the download test
    pub path: Option<PathBuf>,

    /// Number of sessions allowed to test at the same time
    pub max_active: usize,

    /// Idle time after which a session is dropped, in seconds
    pub stale_after_secs: u64,

    /// Interval between staleness checks, in seconds
    pub prune_interval_secs: u64,

    /// Interval between queue length samples, in seconds
    pub sample_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 80,
            only_auth: false,
            path: None,
            max_active: 3,
            stale_after_secs: 30,
            prune_interval_secs: 3,
            sample_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Speedtest client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URI of the speedtest server
    pub uri: String,

    /// Number of parallel connections
    pub connections: usize,

    /// Skip the negotiate and collect phases
    pub skip_negotiation: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri: "http://127.0.0.1/speedtest".to_string(),
            connections: 4,
            skip_negotiation: false,
        }
    }
}
