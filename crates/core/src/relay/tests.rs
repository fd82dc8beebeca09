use async_trait::async_trait;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::Router;
use http::{HeaderMap, StatusCode, Uri};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use torfluxdb_common::{BackendAddr, GatewayError, RelayError};
use tracing_test::traced_test;

use super::{RelayConfig, RelayService, RelayState};
use crate::gateway::{Gateway, LocalGateway, LocalListener, LocalTransport, OnionListener, Transport};
use crate::identity::{OnionAddress, ServiceIdentity};

// -- Test helpers --

/// Records what a [`TestTransport`] did with its gateways
#[derive(Default)]
struct Recorder {
    starts: AtomicUsize,
    live: AtomicUsize,
    log: Mutex<Vec<&'static str>>,
    terminate: CancellationToken,
}

impl Recorder {
    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    FailStart,
    FailListen,
    StallListen,
}

/// Loopback transport with scripted failures and teardown bookkeeping
struct TestTransport {
    mode: Mode,
    recorder: Arc<Recorder>,
}

impl TestTransport {
    fn new(mode: Mode) -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            Self {
                mode,
                recorder: recorder.clone(),
            },
            recorder,
        )
    }
}

#[async_trait]
impl Transport for TestTransport {
    type Gateway = TestGateway;

    async fn start(&self) -> Result<TestGateway, GatewayError> {
        self.recorder.starts.fetch_add(1, Ordering::SeqCst);
        if self.mode == Mode::FailStart {
            return Err(GatewayError::exited("refused to start"));
        }
        let inner = LocalTransport::loopback().start().await?;
        self.recorder.live.fetch_add(1, Ordering::SeqCst);
        Ok(TestGateway {
            inner,
            mode: self.mode,
            recorder: self.recorder.clone(),
        })
    }
}

struct TestGateway {
    inner: LocalGateway,
    mode: Mode,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Gateway for TestGateway {
    type Listener = TestListener;

    async fn listen(
        &mut self,
        identity: &ServiceIdentity,
        remote_port: u16,
    ) -> Result<TestListener, GatewayError> {
        match self.mode {
            Mode::StallListen => std::future::pending::<Result<TestListener, GatewayError>>().await,
            Mode::FailListen => Err(GatewayError::Protocol {
                code: 512,
                message: "Invalid port".into(),
            }),
            _ => Ok(TestListener {
                inner: self.inner.listen(identity, remote_port).await?,
                recorder: self.recorder.clone(),
            }),
        }
    }

    async fn terminated(&self) -> String {
        self.recorder.terminate.cancelled().await;
        "tor process exited with signal: 9".to_string()
    }

    async fn close(&mut self) {
        if !self.inner.is_closed() {
            self.inner.close().await;
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
            self.recorder.log.lock().unwrap().push("gateway");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct TestListener {
    inner: LocalListener,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl OnionListener for TestListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    fn address(&self) -> OnionAddress {
        self.inner.address()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&mut self) {
        if !self.inner.is_closed() {
            self.inner.close().await;
            self.recorder.log.lock().unwrap().push("listener");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

fn backend_config(backend: SocketAddr) -> RelayConfig {
    RelayConfig::new(BackendAddr::parse(&backend.to_string()).unwrap())
}

fn unused_backend() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn bootstrap_err(transport: &TestTransport, config: RelayConfig) -> RelayError {
    let identity = ServiceIdentity::generate();
    match RelayService::bootstrap(transport, &identity, config).await {
        Ok(_) => panic!("bootstrap unexpectedly succeeded"),
        Err(err) => err,
    }
}

async fn spawn_backend_on(listener: TcpListener) {
    let router = Router::new()
        .route(
            "/ping",
            get(|| async { (StatusCode::NO_CONTENT, [("x-influxdb-version", "1.8.10")]) }),
        )
        .route("/echo/:token", get(|Path(token): Path<String>| async move { token }))
        .route("/hang", get(|| std::future::pending::<&'static str>()))
        .route(
            "/write",
            post(|headers: HeaderMap, uri: Uri, body: String| async move {
                let host = headers
                    .get(http::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let token = headers
                    .get("authorization")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!(
                    "{}|{}|{}|{}",
                    host,
                    token,
                    uri.query().unwrap_or_default(),
                    body
                )
            }),
        );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

/// Spawns an InfluxDB stand-in
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_backend_on(listener).await;
    addr
}

/// Bootstraps a loopback relay and serves it in the background
async fn spawn_relay(
    backend: SocketAddr,
) -> (SocketAddr, CancellationToken, JoinHandle<RelayError>) {
    let identity = ServiceIdentity::generate();
    let mut relay = RelayService::bootstrap(
        &LocalTransport::loopback(),
        &identity,
        backend_config(backend),
    )
    .await
    .unwrap();
    let addr = relay.local_addr().unwrap();
    let shutdown = relay.shutdown_token();
    let task = tokio::spawn(async move { relay.serve().await });
    (addr, shutdown, task)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

// -- Forwarding --

#[tokio::test]
async fn test_ping_passes_through() {
    let backend = spawn_backend().await;
    let (addr, shutdown, task) = spawn_relay(backend).await;

    let res = client()
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(res.headers()["x-influxdb-version"], "1.8.10");
    assert!(res.bytes().await.unwrap().is_empty());

    shutdown.cancel();
    assert!(task.await.unwrap().is_shutdown());
}

#[tokio::test]
async fn test_write_keeps_query_headers_and_body() {
    let backend = spawn_backend().await;
    let (addr, shutdown, task) = spawn_relay(backend).await;

    let res = client()
        .post(format!("http://{addr}/write?db=metrics&precision=s"))
        .header("authorization", "Token secret")
        .body("cpu,host=a value=0.5 1700000000")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.text().await.unwrap(),
        format!("{backend}|Token secret|db=metrics&precision=s|cpu,host=a value=0.5 1700000000")
    );

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_backend_then_recovery() {
    let backend = unused_backend();
    let (addr, shutdown, task) = spawn_relay(backend).await;
    let client = client();

    let res = client
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        res.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
    assert_eq!(res.headers()["x-content-type-options"], "nosniff");
    let body = res.text().await.unwrap();
    assert!(body.len() > 1);
    assert!(body.ends_with('\n'));

    // Bring the backend up on the same address; the relay keeps serving
    let listener = TcpListener::bind(backend).await.unwrap();
    spawn_backend_on(listener).await;

    let res = client
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    shutdown.cancel();
    assert!(task.await.unwrap().is_shutdown());
}

#[tokio::test]
async fn test_concurrent_requests_do_not_mix() {
    let backend = spawn_backend().await;
    let (addr, shutdown, task) = spawn_relay(backend).await;
    let client = client();

    let mut set = JoinSet::new();
    for i in 0..50 {
        let client = client.clone();
        set.spawn(async move {
            let token = format!("token-{i}");
            let body = client
                .get(format!("http://{addr}/echo/{token}"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            (token, body)
        });
    }

    let mut seen = 0;
    while let Some(result) = set.join_next().await {
        let (token, body) = result.unwrap();
        assert_eq!(token, body);
        seen += 1;
    }
    assert_eq!(seen, 50);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_hung_request_does_not_block_others() {
    let backend = spawn_backend().await;
    let (addr, shutdown, task) = spawn_relay(backend).await;

    let hung = tokio::spawn(async move { client().get(format!("http://{addr}/hang")).send().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let res = tokio::time::timeout(
        Duration::from_secs(3),
        client().get(format!("http://{addr}/ping")).send(),
    )
    .await
    .expect("ping stuck behind a hung request")
    .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!hung.is_finished());

    shutdown.cancel();
    assert!(task.await.unwrap().is_shutdown());
    hung.abort();
}

// -- Bootstrap --

#[tokio::test]
async fn test_zero_deadline_starts_nothing() {
    let (transport, recorder) = TestTransport::new(Mode::Serve);
    let config = backend_config(unused_backend()).with_bootstrap_timeout(Duration::ZERO);

    let err = bootstrap_err(&transport, config).await;
    assert!(matches!(err, RelayError::BootstrapTimeout(d) if d == Duration::ZERO));
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stalled_listen_times_out_and_releases_gateway() {
    let (transport, recorder) = TestTransport::new(Mode::StallListen);
    let config =
        backend_config(unused_backend()).with_bootstrap_timeout(Duration::from_millis(200));

    let err = bootstrap_err(&transport, config).await;
    assert!(matches!(err, RelayError::BootstrapTimeout(_)));
    assert!(err.is_bootstrap());
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.live.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.log(), vec!["gateway"]);
}

#[tokio::test]
async fn test_listen_failure_releases_gateway() {
    let (transport, recorder) = TestTransport::new(Mode::FailListen);

    let err = bootstrap_err(&transport, backend_config(unused_backend())).await;
    assert!(matches!(
        err,
        RelayError::Listen(GatewayError::Protocol { code: 512, .. })
    ));
    assert_eq!(recorder.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_failure() {
    let (transport, recorder) = TestTransport::new(Mode::FailStart);

    let err = bootstrap_err(&transport, backend_config(unused_backend())).await;
    assert!(matches!(err, RelayError::GatewayStart(GatewayError::Exited(_))));
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
    assert!(recorder.log().is_empty());
}

#[tokio::test]
async fn test_address_and_url() {
    let identity = ServiceIdentity::generate();
    let relay = RelayService::bootstrap(
        &LocalTransport::loopback(),
        &identity,
        backend_config(unused_backend()),
    )
    .await
    .unwrap();

    let id = identity.public_address().service_id();
    assert_eq!(relay.address(), identity.public_address());
    assert_eq!(relay.id(), id);
    assert_eq!(relay.url(), format!("http://{id}.onion:8086"));
    assert_eq!(relay.state(), RelayState::Serving);
}

#[tokio::test]
async fn test_custom_onion_port_in_url() {
    let identity = ServiceIdentity::generate();
    let config = backend_config(unused_backend()).with_onion_port(80);
    let relay = RelayService::bootstrap(&LocalTransport::loopback(), &identity, config)
        .await
        .unwrap();

    let id = identity.public_address().service_id();
    assert_eq!(relay.url(), format!("http://{id}.onion:80"));
}

// -- Teardown --

#[tokio::test]
async fn test_close_twice_releases_listener_then_gateway() {
    let (transport, recorder) = TestTransport::new(Mode::Serve);
    let identity = ServiceIdentity::generate();
    let mut relay = RelayService::bootstrap(&transport, &identity, backend_config(unused_backend()))
        .await
        .unwrap();
    assert_eq!(relay.state(), RelayState::Serving);

    relay.close().await;
    relay.close().await;

    assert_eq!(relay.state(), RelayState::Closed);
    assert_eq!(recorder.log(), vec!["listener", "gateway"]);
    assert_eq!(recorder.live.load(Ordering::SeqCst), 0);
    assert!(relay.local_addr().is_err());
    assert!(matches!(relay.serve().await, RelayError::Closed));
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_token_stops_serving() {
    let (transport, recorder) = TestTransport::new(Mode::Serve);
    let identity = ServiceIdentity::generate();
    let mut relay = RelayService::bootstrap(&transport, &identity, backend_config(unused_backend()))
        .await
        .unwrap();
    let shutdown = relay.shutdown_token();

    let task = tokio::spawn(async move {
        let err = relay.serve().await;
        (relay, err)
    });
    shutdown.cancel();

    let (relay, err) = task.await.unwrap();
    assert!(err.is_shutdown());
    assert_eq!(relay.state(), RelayState::Closed);
    assert_eq!(recorder.log(), vec!["listener", "gateway"]);
    assert!(logs_contain("Relay state"));
}

#[tokio::test]
async fn test_gateway_termination_fails_serve() {
    let (transport, recorder) = TestTransport::new(Mode::Serve);
    let identity = ServiceIdentity::generate();
    let mut relay = RelayService::bootstrap(&transport, &identity, backend_config(unused_backend()))
        .await
        .unwrap();

    let task = tokio::spawn(async move {
        let err = relay.serve().await;
        (relay, err)
    });
    recorder.terminate.cancel();

    let (relay, err) = task.await.unwrap();
    assert!(matches!(err, RelayError::GatewayTerminated(ref reason) if reason.contains("signal")));
    assert_eq!(relay.state(), RelayState::Failed);
    assert_eq!(recorder.log(), vec!["listener", "gateway"]);
    assert_eq!(recorder.live.load(Ordering::SeqCst), 0);
}
