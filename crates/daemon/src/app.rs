use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use torfluxdb_common::{DaemonConfig, TransportKind};
use torfluxdb_core::{
    LocalTransport, RelayConfig, RelayService, ServiceIdentity, TorTransport, Transport,
};
use tracing::{info, info_span, warn};

/// Publish the relay through the configured transport and serve until
/// `shutdown` resolves
///
/// A requested shutdown counts as success; every other way serving can end
/// is returned as an error.
pub async fn run<F>(identity: &ServiceIdentity, config: &DaemonConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match config.transport {
        TransportKind::Tor => {
            info!("Starting Tor proxy, this might take a minute or so...");
            let transport = TorTransport::new(config.tor.clone());
            serve(&transport, identity, config, shutdown).await
        }
        TransportKind::Local => {
            let bind: SocketAddr = config
                .local_bind
                .parse()
                .with_context(|| format!("Invalid local bind address {:?}", config.local_bind))?;
            warn!("Local transport selected, the service is not published on Tor");
            serve(&LocalTransport::new(bind), identity, config, shutdown).await
        }
    }
}

async fn serve<T, F>(
    transport: &T,
    identity: &ServiceIdentity,
    config: &DaemonConfig,
    shutdown: F,
) -> Result<()>
where
    T: Transport,
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "Endpoint will be published at http://{}",
        identity.public_address()
    );

    let mut relay = RelayService::bootstrap(transport, identity, relay_config(config))
        .await
        .context("Failed to start Tor proxy")?;
    info!("InfluxDB Tor proxy online at http://{}", relay.address());

    let token = relay.shutdown_token();
    let signal = tokio::spawn(async move {
        shutdown.await;
        info!("Shutdown signal received");
        token.cancel();
    });

    let err = relay.serve().await;
    signal.abort();
    if err.is_shutdown() {
        Ok(())
    } else {
        Err(err.into())
    }
}

fn relay_config(config: &DaemonConfig) -> RelayConfig {
    RelayConfig::new(config.backend.clone())
        .with_bootstrap_timeout(config.bootstrap_timeout())
        .with_onion_port(config.onion_port)
        .with_span(info_span!("relay", backend = %config.backend))
}
