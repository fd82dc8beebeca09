/// Anonymity-network gateways
///
/// A [`Transport`] starts a [`Gateway`], the long-lived process or connection
/// that participates in the network. The gateway hands out [`OnionListener`]s
/// bound to a service key. A listener never outlives the gateway it came from.
mod local;
mod tor;

pub use local::{LocalGateway, LocalListener, LocalTransport};
pub use tor::{ControlConnection, DescriptorEvent, Reply, TorGateway, TorListener, TorTransport};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use torfluxdb_common::GatewayError;

use crate::identity::{OnionAddress, ServiceIdentity};

/// Starts gateways
#[async_trait]
pub trait Transport: Send + Sync {
    type Gateway: Gateway;

    /// Launch a gateway and wait until it accepts listen requests
    async fn start(&self) -> Result<Self::Gateway, GatewayError>;
}

/// A running anonymity-network gateway
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    type Listener: OnionListener;

    /// Publish an onion service for `identity`, mapping `remote_port` to a
    /// fresh local listener
    async fn listen(
        &mut self,
        identity: &ServiceIdentity,
        remote_port: u16,
    ) -> Result<Self::Listener, GatewayError>;

    /// Resolves once the gateway stopped on its own, with a description of why
    ///
    /// Never resolves after [`Gateway::close`] was requested by the owner.
    async fn terminated(&self) -> String;

    /// Release the gateway; safe to call repeatedly
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Inbound side of a published onion service
#[async_trait]
pub trait OnionListener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection
    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address the service is published under
    fn address(&self) -> OnionAddress;

    /// Local socket the gateway forwards onion traffic to
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Withdraw the service; safe to call repeatedly
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}
