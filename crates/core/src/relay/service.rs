use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use torfluxdb_common::{protocol, BackendAddr, RelayError, Result};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::forward::{Forwarder, HandleRequest};
use crate::gateway::{Gateway, OnionListener, Transport};
use crate::identity::{OnionAddress, ServiceIdentity};

/// How long open connections may finish in-flight requests after close
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration =
    Duration::from_secs(protocol::GRACEFUL_SHUTDOWN_SECS);

/// Relay settings supplied by the caller
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where requests are forwarded to
    pub backend: BackendAddr,

    /// Allowance for starting the gateway and publishing the service
    pub bootstrap_timeout: Duration,

    /// Remote port of the onion service
    pub onion_port: u16,

    /// Span all relay events are recorded in
    pub span: Span,
}

impl RelayConfig {
    pub fn new(backend: BackendAddr) -> Self {
        Self {
            backend,
            bootstrap_timeout: Duration::from_secs(protocol::DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            onion_port: protocol::ONION_PORT,
            span: info_span!("relay"),
        }
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_onion_port(mut self, port: u16) -> Self {
        self.onion_port = port;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Lifecycle of a [`RelayService`]
///
/// A `RelayService` only exists once bootstrap has succeeded, so
/// [`RelayService::state`] reports `Serving`, `Closed` or `Failed`.
/// `Uninitialized` and `Bootstrapping` name the phases before that and only
/// show up in transition logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Uninitialized,
    Bootstrapping,
    Serving,
    Closed,
    Failed,
}

/// Onion service relaying every request to a fixed backend
///
/// Owns the gateway and the listener published through it. The listener is
/// always released before the gateway.
pub struct RelayService<G: Gateway> {
    // Field order matters: drop releases the listener first
    listener: Option<G::Listener>,
    gateway: Option<G>,
    address: OnionAddress,
    onion_port: u16,
    backend: BackendAddr,
    handler: Arc<dyn HandleRequest>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    state: RelayState,
    span: Span,
}

impl<G: Gateway> RelayService<G> {
    /// Start a gateway and publish the service, forwarding to `config.backend`
    pub async fn bootstrap<T>(
        transport: &T,
        identity: &ServiceIdentity,
        config: RelayConfig,
    ) -> Result<Self>
    where
        T: Transport<Gateway = G>,
    {
        let handler = Arc::new(Forwarder::new(config.backend.clone()));
        Self::bootstrap_with_handler(transport, identity, config, handler).await
    }

    /// Like [`RelayService::bootstrap`] with a custom request handler
    pub async fn bootstrap_with_handler<T>(
        transport: &T,
        identity: &ServiceIdentity,
        config: RelayConfig,
        handler: Arc<dyn HandleRequest>,
    ) -> Result<Self>
    where
        T: Transport<Gateway = G>,
    {
        let span = config.span.clone();
        Self::acquire(transport, identity, config, handler)
            .instrument(span)
            .await
    }

    async fn acquire<T>(
        transport: &T,
        identity: &ServiceIdentity,
        config: RelayConfig,
        handler: Arc<dyn HandleRequest>,
    ) -> Result<Self>
    where
        T: Transport<Gateway = G>,
    {
        let timeout = config.bootstrap_timeout;
        let deadline = Instant::now() + timeout;
        debug!(
            "Relay state {:?} -> {:?}",
            RelayState::Uninitialized,
            RelayState::Bootstrapping
        );

        if deadline <= Instant::now() {
            warn!("Bootstrap deadline already passed");
            return Err(RelayError::BootstrapTimeout(timeout));
        }

        // Holds the gateway while it is being set up, so every failure path
        // below can release it
        let mut slot: Option<G> = None;
        let result = tokio::time::timeout_at(deadline, async {
            let gateway = transport.start().await.map_err(RelayError::GatewayStart)?;
            info!("Gateway started");
            slot.insert(gateway)
                .listen(identity, config.onion_port)
                .await
                .map_err(RelayError::Listen)
        })
        .await;

        let listener = match result {
            Ok(Ok(listener)) => listener,
            Ok(Err(err)) => {
                release(slot).await;
                warn!("Bootstrap failed: {}", err);
                return Err(err);
            }
            Err(_) => {
                release(slot).await;
                warn!("Bootstrap did not complete within {:?}", timeout);
                return Err(RelayError::BootstrapTimeout(timeout));
            }
        };
        let Some(gateway) = slot else {
            return Err(RelayError::Closed);
        };

        let address = listener.address();
        info!(
            "Relay state {:?} -> {:?}",
            RelayState::Bootstrapping,
            RelayState::Serving
        );
        Ok(Self {
            listener: Some(listener),
            gateway: Some(gateway),
            address,
            onion_port: config.onion_port,
            backend: config.backend,
            handler,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: RelayState::Serving,
            span: config.span,
        })
    }

    /// Accept and relay connections until the listener or gateway fails, or
    /// shutdown is requested
    ///
    /// Always returns the reason serving stopped, and always leaves the relay
    /// closed. A requested shutdown is reported as [`RelayError::Shutdown`].
    pub async fn serve(&mut self) -> RelayError {
        let span = self.span.clone();
        async {
            let err = self.accept_loop().await;
            self.close().await;
            if !err.is_shutdown() && !matches!(err, RelayError::Closed) {
                self.set_state(RelayState::Failed);
                warn!("Relay stopped: {}", err);
            } else {
                info!("Relay stopped: {}", err);
            }
            err
        }
        .instrument(span)
        .await
    }

    async fn accept_loop(&mut self) -> RelayError {
        if self.state != RelayState::Serving {
            return RelayError::Closed;
        }
        let Self {
            listener,
            gateway,
            handler,
            shutdown,
            tasks,
            span,
            ..
        } = self;
        let (Some(listener), Some(gateway)) = (listener.as_mut(), gateway.as_ref()) else {
            return RelayError::Closed;
        };
        match listener.local_addr() {
            Ok(addr) => info!("Serving {} on {}", listener.address(), addr),
            Err(_) => info!("Serving {}", listener.address()),
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return RelayError::Shutdown,
                reason = gateway.terminated() => return RelayError::GatewayTerminated(reason),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        tasks.spawn(
                            serve_connection(stream, handler.clone(), shutdown.child_token())
                                .instrument(info_span!(parent: &*span, "conn", %peer)),
                        );
                    }
                    Err(e) => return RelayError::Accept(e),
                },
            }
        }
    }

    /// Stop serving and release the listener, then the gateway
    ///
    /// Waits up to [`GRACEFUL_SHUTDOWN_TIMEOUT`] for open connections.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.listener.is_none() && self.gateway.is_none() {
            return;
        }
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Connections still open after {:?}, abandoning",
                GRACEFUL_SHUTDOWN_TIMEOUT
            );
        }

        if let Some(mut listener) = self.listener.take() {
            listener.close().await;
        }
        if let Some(mut gateway) = self.gateway.take() {
            gateway.close().await;
        }
        self.set_state(RelayState::Closed);
    }

    /// Token that stops [`RelayService::serve`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current lifecycle state; starts out as [`RelayState::Serving`]
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// The published onion address
    pub fn address(&self) -> OnionAddress {
        self.address
    }

    /// The bare service id, without `.onion`
    pub fn id(&self) -> String {
        self.address.service_id()
    }

    /// URL clients reach the relay under
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address.to_hostname(), self.onion_port)
    }

    pub fn backend(&self) -> &BackendAddr {
        &self.backend
    }

    /// Local socket the gateway delivers onion connections to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener.as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "relay closed")),
        }
    }

    fn set_state(&mut self, state: RelayState) {
        if self.state != state {
            info!("Relay state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

async fn release<G: Gateway>(slot: Option<G>) {
    if let Some(mut gateway) = slot {
        gateway.close().await;
    }
}

async fn serve_connection<S>(
    stream: S,
    handler: Arc<dyn HandleRequest>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(request).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!("Connection closed with error: {}", e);
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, conn).await.is_err() {
                debug!("Connection dropped at shutdown");
            }
        }
    }
}
