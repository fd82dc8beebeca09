/// Tor gateway driven over the control protocol
///
/// Starts a private `tor` process with an empty torrc, authenticates with the
/// control cookie and publishes services through `ADD_ONION`.
mod control;

pub use control::{ControlConnection, DescriptorEvent, Reply};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use torfluxdb_common::{protocol, GatewayError, TorConfig};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{Gateway, OnionListener, Transport};
use crate::identity::{OnionAddress, ServiceIdentity};
use control::{bootstrap_progress, descriptor_event, parse_port_file};

const PORT_FILE: &str = "control.port";
const COOKIE_FILE: &str = "control_auth_cookie";
const TORRC_FILE: &str = "torrc";

/// Poll interval while waiting on tor's startup files and bootstrap progress
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest wait for tor to acknowledge a service removal
const CONTROL_TIMEOUT: Duration = Duration::from_secs(protocol::GRACEFUL_SHUTDOWN_SECS);

type SharedControl = Arc<Mutex<ControlConnection<TcpStream>>>;

/// Launches `tor` child processes
#[derive(Debug, Clone, Default)]
pub struct TorTransport {
    config: TorConfig,
}

impl TorTransport {
    pub fn new(config: TorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TorTransport {
    type Gateway = TorGateway;

    async fn start(&self) -> Result<TorGateway, GatewayError> {
        let (temp_dir, data_dir) = match &self.config.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                (None, dir.clone())
            }
            None => {
                let dir = tempfile::Builder::new().prefix("torfluxdb").tempdir()?;
                let path = dir.path().to_path_buf();
                (Some(dir), path)
            }
        };

        let torrc = data_dir.join(TORRC_FILE);
        let port_file = data_dir.join(PORT_FILE);
        tokio::fs::write(&torrc, b"").await?;
        match tokio::fs::remove_file(&port_file).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut command = Command::new(&self.config.binary);
        command
            .arg("-f")
            .arg(&torrc)
            .args(["--SocksPort", "0", "--ControlPort", "auto"])
            .arg("--ControlPortWriteToFile")
            .arg(&port_file)
            .args(["--CookieAuthentication", "1"])
            .arg("--DataDirectory")
            .arg(&data_dir)
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(GatewayError::Spawn)?;
        info!(
            "Started tor process {} in {}",
            child.id().unwrap_or_default(),
            data_dir.display()
        );

        let control_addr = wait_for_control_port(&mut child, &port_file).await?;
        let stream = TcpStream::connect(control_addr).await.map_err(|e| {
            GatewayError::control_port(format!("failed to connect to {control_addr}: {e}"))
        })?;
        let mut control = ControlConnection::new(stream);

        let cookie = Zeroizing::new(tokio::fs::read(data_dir.join(COOKIE_FILE)).await.map_err(
            |e| GatewayError::Authentication(format!("failed to read control cookie: {e}")),
        )?);
        control.authenticate(&cookie).await?;
        // Tor exits on its own if the controller goes away
        control.send("TAKEOWNERSHIP").await?;
        debug!("Authenticated to tor control port {}", control_addr);

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(child, kill.clone(), exit_tx));

        Ok(TorGateway {
            control: Arc::new(Mutex::new(control)),
            exit: exit_rx,
            kill,
            supervisor: Some(supervisor),
            temp_dir,
            data_dir,
            wait_for_publication: self.config.wait_for_publication,
            closed: false,
        })
    }
}

async fn wait_for_control_port(
    child: &mut Child,
    port_file: &Path,
) -> Result<SocketAddr, GatewayError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(GatewayError::exited(format!(
                "tor exited during startup with {status}"
            )));
        }
        match tokio::fs::read_to_string(port_file).await {
            Ok(contents) => {
                if let Some(addr) = parse_port_file(&contents) {
                    return Ok(addr);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Owns the tor process, reporting its exit unless a kill was requested first
async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    exit: watch::Sender<Option<String>>,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("tor process exited with {status}"),
                Err(e) => format!("failed to wait on tor process: {e}"),
            };
            warn!("{}", reason);
            let _ = exit.send(Some(reason));
        }
        _ = kill.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tor process: {}", e);
            }
            debug!("Tor process stopped");
        }
    }
}

/// A running tor process
pub struct TorGateway {
    control: SharedControl,
    exit: watch::Receiver<Option<String>>,
    kill: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    // Removed on drop, after the process is gone
    temp_dir: Option<TempDir>,
    data_dir: PathBuf,
    wait_for_publication: bool,
    closed: bool,
}

impl TorGateway {
    /// Data directory the process runs in
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn check_alive(&self) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::exited("gateway closed"));
        }
        match self.exit.borrow().as_ref() {
            Some(reason) => Err(GatewayError::exited(reason.clone())),
            None => Ok(()),
        }
    }

    async fn wait_bootstrapped(&self) -> Result<(), GatewayError> {
        let mut last = None;
        loop {
            self.check_alive()?;
            let reply = self
                .control
                .lock()
                .await
                .send("GETINFO status/bootstrap-phase")
                .await?;
            let progress = reply
                .value("status/bootstrap-phase")
                .and_then(bootstrap_progress);
            if progress == Some(100) {
                info!("Tor network bootstrapped");
                return Ok(());
            }
            if progress != last {
                debug!("Tor bootstrap at {}%", progress.unwrap_or_default());
                last = progress;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Gateway for TorGateway {
    type Listener = TorListener;

    async fn listen(
        &mut self,
        identity: &ServiceIdentity,
        remote_port: u16,
    ) -> Result<TorListener, GatewayError> {
        self.wait_bootstrapped().await?;

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let local_addr = listener.local_addr()?;
        let mut control = self.control.lock().await;
        publish(
            &mut *control,
            identity,
            remote_port,
            local_addr,
            self.wait_for_publication,
        )
        .await?;
        drop(control);

        Ok(TorListener {
            listener: Some(listener),
            address: identity.public_address(),
            control: self.control.clone(),
        })
    }

    async fn terminated(&self) -> String {
        let mut exit = self.exit.clone();
        let reason = match exit.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            // Supervisor is gone without a reported exit, i.e. we killed it
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.kill.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!("Tor supervisor task failed: {}", e);
            }
        }
        self.temp_dir.take();
        info!("Tor gateway closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TorGateway {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Register the onion service for `identity`, forwarding `remote_port` to
/// `local_addr`, and optionally wait until its descriptor is uploaded
async fn publish<S>(
    control: &mut ControlConnection<S>,
    identity: &ServiceIdentity,
    remote_port: u16,
    local_addr: SocketAddr,
    wait_for_publication: bool,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let address = identity.public_address();
    let expected = address.service_id();

    if wait_for_publication {
        control.send("SETEVENTS HS_DESC").await?;
    }

    let command = Zeroizing::new(format!(
        "ADD_ONION {} Port={},{}",
        identity.tor_key_blob().as_str(),
        remote_port,
        local_addr
    ));
    let reply = control.send(&command).await?;
    let service_id = reply.value("ServiceID").unwrap_or_default().to_string();
    if service_id != expected {
        if let Err(e) = control.send(&format!("DEL_ONION {service_id}")).await {
            debug!("Failed to remove mismatched onion service: {}", e);
        }
        return Err(GatewayError::AddressMismatch {
            expected,
            actual: service_id,
        });
    }
    info!("Onion service {} added, forwarding to {}", address, local_addr);

    if wait_for_publication {
        loop {
            let event = control.next_event().await?;
            let Some(line) = event.lines.first() else {
                continue;
            };
            match descriptor_event(line) {
                DescriptorEvent::Uploaded(id) if id == service_id => break,
                DescriptorEvent::Failed(id) if id == service_id => {
                    debug!("Descriptor upload to one directory failed, waiting on others");
                }
                _ => {}
            }
        }
        control.send("SETEVENTS").await?;
        info!("Onion service descriptor published");
    }
    Ok(())
}

/// Remove a published service, giving up after `limit`
async fn withdraw<S>(
    control: &Mutex<ControlConnection<S>>,
    service_id: &str,
    limit: Duration,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let command = format!("DEL_ONION {service_id}");
    match tokio::time::timeout(limit, async {
        control.lock().await.send(&command).await
    })
    .await
    {
        Ok(reply) => reply.map(|_| ()),
        Err(_) => Err(GatewayError::control_port(format!(
            "no reply to DEL_ONION within {limit:?}"
        ))),
    }
}

/// Local endpoint of an onion service published through [`TorGateway`]
pub struct TorListener {
    listener: Option<TcpListener>,
    address: OnionAddress,
    control: SharedControl,
}

#[async_trait]
impl OnionListener for TorListener {
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
        if self.listener.take().is_none() {
            return;
        }
        let service_id = self.address.service_id();
        match withdraw(&*self.control, &service_id, CONTROL_TIMEOUT).await {
            Ok(()) => info!("Onion service {} removed", self.address),
            // The gateway may already be gone, taking the service with it
            Err(e) => debug!("Failed to remove onion service {}: {}", self.address, e),
        }
    }

    fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}
