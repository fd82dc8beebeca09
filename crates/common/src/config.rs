use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::BackendAddr;

/// Relay protocol constants
pub mod protocol {
    /// Remote port published on the onion service, InfluxDB's conventional port
    pub const ONION_PORT: u16 = 8086;

    /// Default address of the backing InfluxDB instance
    pub const DEFAULT_BACKEND: &str = "localhost:8086";

    /// Default time allowance to join the Tor network
    pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 180;

    /// Environment variable carrying a hex encoded onion private key
    pub const ONION_KEY_ENV: &str = "TORFLUXDB_ONIONKEY";

    /// How long in-flight connections may linger once the relay closes
    pub const GRACEFUL_SHUTDOWN_SECS: u64 = 1;
}

/// Tor gateway process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Path or name of the tor executable
    pub binary: PathBuf,

    /// Persistent data directory; a temporary one is used when unset
    pub data_dir: Option<PathBuf>,

    /// Extra command line arguments passed to tor verbatim
    pub extra_args: Vec<String>,

    /// Wait for the onion descriptor to be published before serving
    pub wait_for_publication: bool,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            data_dir: None,
            extra_args: Vec::new(),
            wait_for_publication: true,
        }
    }
}

/// Which gateway implementation the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tor,
    Local,
}

/// Daemon configuration, loadable from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address of the backing InfluxDB instance
    pub backend: BackendAddr,

    /// Seconds allowed for joining the network and publishing the service
    pub bootstrap_timeout_secs: u64,

    /// Remote port of the onion service
    pub onion_port: u16,

    /// Gateway implementation
    pub transport: TransportKind,

    /// Bind address for the local transport
    pub local_bind: String,

    /// Tor process settings
    pub tor: TorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bootstrap_timeout_secs: protocol::DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            onion_port: protocol::ONION_PORT,
            transport: TransportKind::default(),
            local_bind: "127.0.0.1:0".to_string(),
            tor: TorConfig::default(),
        }
    }
}

fn default_backend() -> BackendAddr {
    match BackendAddr::parse(protocol::DEFAULT_BACKEND) {
        Ok(addr) => addr,
        Err(err) => unreachable!("default backend must parse: {err}"),
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendAddr) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
