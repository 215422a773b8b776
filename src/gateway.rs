//! Request dispatch for the sleeping project
//!
//! Every request lands here. The proxy's own endpoints (`/{prefix}/health`,
//! `/{prefix}/shutdown`, `/{prefix}/status`) and the bundled assets are
//! answered directly; everything else wakes the project if needed, then
//! either gets the loading page or is forwarded to the target.

use crate::assets::{self, STATIC_PREFIX};
use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::orchestrator::ServiceGroup;
use crate::pool::{ConnectionPool, ProxyBody};
use crate::readiness::ReadinessChecker;
use crate::state::SharedState;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upper bound on the upstream's reply to an upgrade request
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Settings the dispatcher needs from the configuration
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Path prefix of the proxy's own endpoints, without slashes
    pub endpoint_prefix: String,
    /// Poll interval embedded in the loading page
    pub poll_interval: Duration,
    /// Idle threshold, reported by the status endpoint
    pub idle_threshold: Duration,
    pub probe_path: String,
    pub probe_timeout: Duration,
}

impl GatewayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint_prefix: config.endpoint_prefix.clone(),
            poll_interval: config.check_interval(),
            idle_threshold: config.sleep_timeout(),
            probe_path: config.probe_path.clone(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Which of the proxy's own endpoints a path names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Health,
    Shutdown,
    Status,
}

/// Dispatcher shared by every connection
pub struct Gateway {
    state: SharedState,
    group: ServiceGroup,
    readiness: ReadinessChecker,
    pool: Arc<ConnectionPool>,
    options: GatewayOptions,
}

impl Gateway {
    pub fn new(
        state: SharedState,
        group: ServiceGroup,
        pool: Arc<ConnectionPool>,
        options: GatewayOptions,
    ) -> Self {
        let readiness = ReadinessChecker::new(
            group.clone(),
            Arc::clone(&pool),
            options.probe_path.clone(),
            options.probe_timeout,
        );
        Self {
            state,
            group,
            readiness,
            pool,
            options,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Route one request. Never fails: every error becomes a response.
    pub async fn handle(&self, req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        if let Some(endpoint) = self.endpoint_for(req.uri().path()) {
            return match endpoint {
                Endpoint::Health => match *req.method() {
                    Method::GET => self.health().await,
                    _ => json_error_response(ProxyErrorCode::MethodNotAllowed, "Use GET to query health"),
                },
                Endpoint::Shutdown => match *req.method() {
                    Method::GET | Method::POST => self.shutdown().await,
                    _ => json_error_response(
                        ProxyErrorCode::MethodNotAllowed,
                        "Use GET or POST to request a shutdown",
                    ),
                },
                Endpoint::Status => self.status(),
            };
        }

        if let Some(name) = req.uri().path().strip_prefix(STATIC_PREFIX) {
            return assets::serve_static(name);
        }

        self.dispatch(req, client_addr).await
    }

    fn endpoint_for(&self, path: &str) -> Option<Endpoint> {
        let rest = path
            .strip_prefix('/')?
            .strip_prefix(self.options.endpoint_prefix.as_str())?
            .strip_prefix('/')?;
        match rest {
            "health" => Some(Endpoint::Health),
            "shutdown" => Some(Endpoint::Shutdown),
            "status" => Some(Endpoint::Status),
            _ => None,
        }
    }

    /// Wake, wait, or forward
    async fn dispatch(&self, req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        self.state.record_activity();

        if self.state.try_begin_start() {
            self.start_project().await;
        }

        if !self.readiness.is_ready().await {
            debug!(method = %req.method(), uri = %req.uri(), "Project not ready, serving loading page");
            return assets::render_loading_page(self.options.poll_interval, &self.options.endpoint_prefix);
        }

        self.forward(req, client_addr).await
    }

    /// Issue the start for a project that was down. Called only by the
    /// request that flipped the state up.
    async fn start_project(&self) {
        info!(group = self.group.key(), "Project is down, starting containers");

        match self.group.start_all().await {
            Ok(report) if report.all_failed() => {
                error!(
                    group = self.group.key(),
                    failed = report.failed,
                    "Every container failed to start"
                );
                self.state.mark_down();
            }
            Ok(report) => {
                info!(
                    group = self.group.key(),
                    started = report.succeeded,
                    failed = report.failed,
                    already_running = report.members - report.attempted,
                    "Start issued"
                );
            }
            Err(e) => {
                error!(group = self.group.key(), error = %e, "Failed to list containers to start");
                self.state.mark_down();
            }
        }
    }

    async fn forward(&self, mut req: Request<ProxyBody>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let upgrade = is_upgrade_request(&req);
        if !upgrade {
            strip_hop_by_hop(req.headers_mut());
        }
        set_forwarding_headers(&mut req, client_addr, &request_id);

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

        if upgrade {
            return self.tunnel(req, request_id).await;
        }

        match self.pool.send_request(req).await {
            Ok(response) => {
                let state = Arc::clone(&self.state);
                let mut response = response.map(move |body| {
                    body.map_err(move |e| {
                        warn!(error = %e, "Upstream response body failed");
                        state.mark_down();
                        e
                    })
                    .boxed()
                });
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                error!(upstream = self.pool.target(), request_id, error = %e, "Failed to forward request");
                self.state.mark_down();
                json_error_response(ProxyErrorCode::BackendUnavailable, "Service temporarily unavailable")
            }
        }
    }

    /// Relay an HTTP upgrade (WebSocket) over a raw TCP connection to the target
    async fn tunnel(&self, req: Request<ProxyBody>, request_id: String) -> Response<ProxyBody> {
        let protocol = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(request_id, protocol, "Handling upgrade request");

        let mut upstream = match TcpStream::connect(self.pool.target()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(upstream = self.pool.target(), error = %e, "Failed to connect for upgrade");
                self.state.mark_down();
                return json_error_response(ProxyErrorCode::BackendUnavailable, "Service temporarily unavailable");
            }
        };

        if let Err(e) = upstream.write_all(&build_upgrade_request(&req)).await {
            error!(request_id, error = %e, "Failed to send upgrade request");
            self.state.mark_down();
            return json_error_response(ProxyErrorCode::BackendUnavailable, "Service temporarily unavailable");
        }

        let (head, leftover) = match read_response_head(&mut upstream).await {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                error!(request_id, "Upstream closed before answering upgrade");
                self.state.mark_down();
                return json_error_response(ProxyErrorCode::BackendUnavailable, "Service temporarily unavailable");
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to read upgrade response");
                self.state.mark_down();
                return json_error_response(ProxyErrorCode::BackendUnavailable, "Service temporarily unavailable");
            }
        };

        let Some((status, headers)) = parse_response_head(&head) else {
            error!(request_id, "Invalid upgrade response from upstream");
            return json_error_response(ProxyErrorCode::InternalError, "Invalid upgrade response from upstream");
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
                || name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(request_id, %status, "Upstream rejected upgrade");
            return builder
                .body(Full::new(Bytes::from(leftover)).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| {
                    json_error_response(ProxyErrorCode::InternalError, "Invalid upgrade response from upstream")
                });
        }

        info!(request_id, protocol, "Upgrade accepted, tunnelling");

        let state = Arc::clone(&self.state);
        state.tunnel_opened();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => relay(TokioIo::new(upgraded), upstream, &leftover, &request_id).await,
                Err(e) => error!(request_id, error = %e, "Client upgrade failed"),
            }
            state.tunnel_closed();
        });

        builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| {
                json_error_response(ProxyErrorCode::InternalError, "Invalid upgrade response from upstream")
            })
    }

    /// Record activity and report readiness. Never starts the project.
    async fn health(&self) -> Response<ProxyBody> {
        self.state.record_activity();

        if self.readiness.is_ready().await {
            json_response(StatusCode::OK, &serde_json::json!({ "status": "ready" }))
        } else {
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &serde_json::json!({ "status": "starting" }),
            )
        }
    }

    /// Stop the project now. The state always ends down.
    async fn shutdown(&self) -> Response<ProxyBody> {
        info!(group = self.group.key(), "Manual shutdown requested");

        let result = self.group.stop_all().await;
        self.state.mark_down();

        match result {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(failed = report.failed, stopped = report.succeeded, "Some containers failed to stop");
                }
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "status": "success",
                        "message": "Containers stopped",
                        "members": report.members,
                        "stopped": report.succeeded,
                        "failed": report.failed,
                    }),
                )
            }
            Err(e) => {
                error!(group = self.group.key(), error = %e, "Manual shutdown failed");
                json_error_response(ProxyErrorCode::StopFailed, "Failed to list project containers")
            }
        }
    }

    fn status(&self) -> Response<ProxyBody> {
        let stats = self.pool.stats();
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "group": self.group.key(),
                "up": self.state.is_up(),
                "idle_secs": self.state.idle_duration().as_secs(),
                "open_tunnels": self.state.open_tunnels(),
                "sleep_timeout_secs": self.options.idle_threshold.as_secs(),
                "check_interval_secs": self.options.poll_interval.as_secs(),
                "target": self.pool.target(),
                "pool": {
                    "total_requests": stats.get_total_requests(),
                    "failed_requests": stats.get_failed_requests(),
                    "probes": stats.get_probes(),
                },
            }),
        )
    }
}

/// Copy bytes both ways until either side closes. `leftover` holds bytes the
/// upstream sent right after its 101 head.
async fn relay<C>(mut client: C, mut upstream: TcpStream, leftover: &[u8], request_id: &str)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        if let Err(e) = client.write_all(leftover).await {
            debug!(request_id, error = %e, "Tunnel closed early");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(request_id, to_upstream, to_client, "Tunnel closed");
        }
        Err(e) => debug!(request_id, error = %e, "Tunnel closed with error"),
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Overwrite the X-Forwarded-* headers; this proxy is the first trusted hop
fn set_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, request_id: &str) {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Serialize the head of an upgrade request for the raw upstream connection
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    head.push_str("\r\n");

    head.into_bytes()
}

/// Read until the end of the response head. Returns the head (without the
/// blank line) and any bytes that arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok(Some((buf, leftover)));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Parse `HTTP/1.1 101 Switching Protocols` plus headers
fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}
