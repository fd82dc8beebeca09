/// torfluxdb - anonymous metrics relay
///
/// Publishes a Tor onion service and forwards every request it receives to
/// a private InfluxDB instance.
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use torfluxdb_daemon::{configured_key, key_banner, load_identity, run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = cli.load_config().context("Failed to load configuration")?;
    let identity = load_identity(configured_key().as_deref())
        .context("Failed to load onion private key (TORFLUXDB_ONIONKEY)")?;

    if cli.printkey {
        for line in key_banner(&identity) {
            info!("{}", line);
        }
    }

    run(&identity, &config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
