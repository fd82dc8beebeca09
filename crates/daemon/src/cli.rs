use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use torfluxdb_common::{BackendAddr, ConfigError, DaemonConfig, TransportKind};

/// Command line of the `torfluxdb` binary
///
/// Flags left unset fall back to the config file, then to built-in defaults.
#[derive(Parser, Debug)]
#[command(
    name = "torfluxdb",
    about = "Tor onion service in front of an InfluxDB instance",
    version
)]
pub struct Cli {
    /// Print the Tor onion private key on startup
    #[arg(long)]
    pub printkey: bool,

    /// Time allowance to join the Tor network, in seconds [default: 180]
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Address of the backing InfluxDB instance [default: localhost:8086]
    #[arg(long, value_name = "HOST:PORT")]
    pub influxdb: Option<BackendAddr>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Tor executable to launch
    #[arg(long, value_name = "PATH")]
    pub tor_binary: Option<PathBuf>,

    /// Persistent Tor data directory instead of a temporary one
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Gateway to publish through: tor, or local for a plain loopback listener
    #[arg(long, value_parser = parse_transport)]
    pub transport: Option<TransportKind>,

    /// Bind address of the local transport
    #[arg(long, value_name = "ADDR")]
    pub local_bind: Option<SocketAddr>,
}

fn parse_transport(s: &str) -> Result<TransportKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "tor" => Ok(TransportKind::Tor),
        "local" => Ok(TransportKind::Local),
        other => Err(format!("unknown transport {other:?}, expected tor or local")),
    }
}

impl Cli {
    /// Merge the config file (if any) with the flags given on the command line
    pub fn load_config(&self) -> Result<DaemonConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(timeout) = self.timeout {
            config.bootstrap_timeout_secs = timeout;
        }
        if let Some(backend) = &self.influxdb {
            config.backend = backend.clone();
        }
        if let Some(binary) = &self.tor_binary {
            config.tor.binary = binary.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.tor.data_dir = Some(dir.clone());
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(bind) = self.local_bind {
            config.local_bind = bind.to_string();
        }
        Ok(config)
    }
}
