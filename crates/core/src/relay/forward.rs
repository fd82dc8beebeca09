use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use torfluxdb_common::BackendAddr;
use tracing::{info, warn};

/// Response body produced by request handlers
pub type RelayBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Handles a single inbound request
///
/// Implementations must answer every request; failures are expressed as
/// error responses, never as a dropped request.
#[async_trait]
pub trait HandleRequest: Send + Sync + 'static {
    async fn handle(&self, request: Request<Incoming>) -> Response<RelayBody>;
}

/// Per-request forwarding failures
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to rewrite request target: {0}")]
    Rewrite(#[from] http::Error),

    #[error("Failed to forward request")]
    Transport(#[source] hyper_util::client::legacy::Error),
}

/// Replays requests against the backend over plain HTTP/1.1
#[derive(Debug, Clone)]
pub struct Forwarder {
    backend: BackendAddr,
    client: Client<HttpConnector, Incoming>,
}

impl Forwarder {
    pub fn new(backend: BackendAddr) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { backend, client }
    }

    pub fn backend(&self) -> &BackendAddr {
        &self.backend
    }

    /// Point the request at the backend, keeping method, path, query, headers and body
    fn rewrite(&self, mut request: Request<Incoming>) -> Result<Request<Incoming>, ForwardError> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = Uri::builder()
            .scheme("http")
            .authority(self.backend.authority().clone())
            .path_and_query(path)
            .build()?;
        *request.uri_mut() = uri;

        let host = HeaderValue::from_str(self.backend.as_str())
            .map_err(|e| ForwardError::Rewrite(e.into()))?;
        request.headers_mut().insert(header::HOST, host);
        Ok(request)
    }

    async fn forward(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let request = self.rewrite(request)?;
        self.client
            .request(request)
            .await
            .map_err(ForwardError::Transport)
    }
}

#[async_trait]
impl HandleRequest for Forwarder {
    async fn handle(&self, request: Request<Incoming>) -> Response<RelayBody> {
        match self.forward(request).await {
            Ok(response) => {
                info!("Metrics request forwarded successfully: {}", response.status());
                response.map(|body| body.boxed_unsync())
            }
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::new(err));
                warn!("Failed to forward metrics request: {}", message);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

/// Plain text error reply, newline terminated
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<RelayBody> {
    let mut text = message.into();
    text.push('\n');
    let body = Full::new(Bytes::from(text))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
