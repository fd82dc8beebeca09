use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use torfluxdb_common::GatewayError;
use tracing::{debug, info};

use super::{Gateway, OnionListener, Transport};
use crate::identity::{OnionAddress, ServiceIdentity};

/// Loopback transport that publishes nothing
///
/// Binds a plain TCP listener instead of an onion service while still
/// reporting the key-derived address. Meant for development against a local
/// backend and for exercising the relay without a Tor network.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    bind_addr: SocketAddr,
}

impl LocalTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }

    /// Listen on an ephemeral loopback port
    pub fn loopback() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Gateway = LocalGateway;

    async fn start(&self) -> Result<LocalGateway, GatewayError> {
        debug!("Local gateway started");
        Ok(LocalGateway {
            bind_addr: self.bind_addr,
            terminate: CancellationToken::new(),
            closed: false,
        })
    }
}

/// Gateway half of [`LocalTransport`]
#[derive(Debug)]
pub struct LocalGateway {
    bind_addr: SocketAddr,
    terminate: CancellationToken,
    closed: bool,
}

impl LocalGateway {
    /// Token that, once cancelled, makes the gateway report itself as terminated
    pub fn terminate_handle(&self) -> CancellationToken {
        self.terminate.clone()
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    type Listener = LocalListener;

    async fn listen(
        &mut self,
        identity: &ServiceIdentity,
        remote_port: u16,
    ) -> Result<LocalListener, GatewayError> {
        if self.closed {
            return Err(GatewayError::exited("local gateway closed"));
        }
        let listener = TcpListener::bind(self.bind_addr).await?;
        let address = identity.public_address();
        info!(
            "Local listener for {}:{} on {}",
            address,
            remote_port,
            listener.local_addr()?
        );
        Ok(LocalListener {
            listener: Some(listener),
            address,
        })
    }

    async fn terminated(&self) -> String {
        self.terminate.cancelled().await;
        "local gateway terminated".to_string()
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!("Local gateway closed");
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Listener half of [`LocalTransport`]
#[derive(Debug)]
pub struct LocalListener {
    listener: Option<TcpListener>,
    address: OnionAddress,
}

#[async_trait]
impl OnionListener for LocalListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self.listener.as_ref() {
            Some(listener) => listener.accept().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    fn address(&self) -> OnionAddress {
        self.address
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener.as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!("Local listener closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}
