//! Connection pool for the proxied service
//!
//! All forwarded requests and readiness probes go through pooled hyper
//! clients so repeated requests reuse connections to the target.

use http_body_util::{combinators::BoxBody, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type used for requests forwarded upstream
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to the target
    pub total_requests: AtomicU64,
    /// Forwarded requests that failed before a response arrived
    pub failed_requests: AtomicU64,
    /// Readiness probes sent
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Result of an application-level probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered with this status
    Responded(StatusCode),
    /// Connection failed or the request errored
    Unreachable,
    TimedOut,
}

impl ProbeOutcome {
    /// Any answer below 500 means the application is serving
    pub fn is_ready(&self) -> bool {
        match self {
            ProbeOutcome::Responded(status) => !status.is_server_error(),
            ProbeOutcome::Unreachable | ProbeOutcome::TimedOut => false,
        }
    }
}

/// Pooled HTTP clients bound to a single target
pub struct ConnectionPool {
    /// `host:port` of the target
    target: String,
    /// Main client for proxying requests
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for probes (uses Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    /// Create a new connection pool for `target` (`host:port`)
    pub fn new(target: impl Into<String>, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let target = target.into();
        debug!(
            upstream = %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            target,
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the target, keeping method, path, query,
    /// headers and body
    pub async fn send_request(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, PoolError> {
        let uri = format!(
            "http://{}{}",
            self.target,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        match self.client.request(upstream_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }

    /// GET `path` on the target, giving up after `timeout`
    pub async fn probe(&self, path: &str, timeout: Duration) -> ProbeOutcome {
        let uri = format!("http://{}{}", self.target, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeOutcome::Unreachable,
        };

        self.stats.record_probe();

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => ProbeOutcome::Responded(response.status()),
            Ok(Err(e)) => {
                debug!(upstream = %self.target, error = %e, "Probe failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(upstream = %self.target, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
                ProbeOutcome::TimedOut
            }
        }
    }
}
