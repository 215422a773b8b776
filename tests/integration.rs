//! Integration tests for Sleepgate

mod common;

use common::{
    body_of, http_get, http_request, mock_upstream, open_tunnel, status_of, upgrade_upstream, wait_for_port,
    MemoryOrchestrator,
};
use sleepgate::config::Config;
use sleepgate::gateway::{Gateway, GatewayOptions};
use sleepgate::monitor::IdleMonitor;
use sleepgate::orchestrator::{RunState, ServiceGroup, SharedOrchestrator};
use sleepgate::pool::{ConnectionPool, PoolConfig};
use sleepgate::proxy::ProxyServer;
use sleepgate::state::{GatewayState, SharedState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running proxy in front of a mock upstream
struct Harness {
    port: u16,
    state: SharedState,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<()>,
}

fn options() -> GatewayOptions {
    GatewayOptions {
        endpoint_prefix: "sleep-proxy".to_string(),
        poll_interval: Duration::from_secs(2),
        idle_threshold: Duration::from_secs(60),
        probe_path: "/".to_string(),
        probe_timeout: Duration::from_millis(500),
    }
}

fn service_group(orchestrator: &Arc<MemoryOrchestrator>) -> ServiceGroup {
    ServiceGroup::new(
        Arc::clone(orchestrator) as SharedOrchestrator,
        "shop",
        "sleep-proxy.exclude",
        Duration::from_secs(1),
    )
}

async fn start_proxy(orchestrator: &Arc<MemoryOrchestrator>, target: String, initially_up: bool) -> Harness {
    let state = GatewayState::new(initially_up);
    let pool = Arc::new(ConnectionPool::new(target, PoolConfig::default()));
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&state),
        service_group(orchestrator),
        pool,
        options(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = ProxyServer::new(listener.local_addr().unwrap(), gateway, shutdown_rx);
    let server = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    assert!(wait_for_port(port, Duration::from_secs(5)).await, "Proxy failed to start");

    Harness {
        port,
        state,
        shutdown_tx,
        server,
    }
}

// ============================================================================
// Wake and proxy
// ============================================================================

#[tokio::test]
async fn test_first_request_wakes_project_then_proxies() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Stopped, None);
    orchestrator.add("db", RunState::Stopped, None);
    let harness = start_proxy(&orchestrator, mock_upstream().await, false).await;

    // The mock upstream already listens, so this may be proxied directly
    let response = http_get(harness.port, "/catalog").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(orchestrator.starts(), 2);
    assert!(harness.state.is_up());
    assert_eq!(orchestrator.state_of("web"), Some(RunState::Running));

    let response = http_get(harness.port, "/sleep-proxy/health").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), r#"{"status":"ready"}"#);

    let response = http_get(harness.port, "/catalog?page=2").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "hello from upstream");
    assert_eq!(orchestrator.starts(), 2);
}

#[tokio::test]
async fn test_loading_page_while_application_boots() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Stopped, None);

    // Nothing listens on the target yet
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = unused.local_addr().unwrap().to_string();
    drop(unused);

    let harness = start_proxy(&orchestrator, target, false).await;

    let response = http_get(harness.port, "/").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(response.to_ascii_lowercase().contains("cache-control: no-store"));
    assert!(body_of(&response).contains(r#"<meta name="check-interval" content="2000">"#));
    assert!(body_of(&response).contains(r#"<meta name="endpoint-prefix" content="sleep-proxy">"#));

    let response = http_get(harness.port, "/sleep-proxy/health").await.unwrap();
    assert_eq!(status_of(&response), 503);
    assert_eq!(body_of(&response), r#"{"status":"starting"}"#);

    // Loading page again, no second start
    http_get(harness.port, "/").await.unwrap();
    assert_eq!(orchestrator.starts(), 1);
}

#[tokio::test]
async fn test_upstream_failure_downgrades_and_next_request_restarts() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    let harness = start_proxy(&orchestrator, mock_upstream().await, true).await;

    let response = http_get(harness.port, "/boom").await.unwrap();
    assert_eq!(status_of(&response), 503);
    assert!(response.contains("BACKEND_UNAVAILABLE"));
    assert!(!harness.state.is_up());

    orchestrator.set_state("web", RunState::Stopped);

    let response = http_get(harness.port, "/").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(orchestrator.starts(), 1);
    assert!(harness.state.is_up());
}

#[tokio::test]
async fn test_health_does_not_start_project() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Stopped, None);
    let harness = start_proxy(&orchestrator, mock_upstream().await, false).await;

    let response = http_get(harness.port, "/sleep-proxy/health").await.unwrap();
    assert_eq!(status_of(&response), 503);
    assert_eq!(orchestrator.starts(), 0);
    assert!(!harness.state.is_up());
}

// ============================================================================
// WebSocket tunnels
// ============================================================================

#[tokio::test]
async fn test_websocket_tunnel_relays_both_ways() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    let harness = start_proxy(&orchestrator, upgrade_upstream().await, true).await;

    let (mut stream, head, mut received) = open_tunnel(harness.port, "/ws").await;
    assert_eq!(status_of(&head), 101);
    assert!(head.to_ascii_lowercase().contains("upgrade: websocket"));

    // Bytes the upstream sent right behind its 101 head
    let mut chunk = [0u8; 64];
    while received.len() < b"welcome".len() {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "tunnel closed before greeting");
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, b"welcome");

    stream.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echo))
        .await
        .expect("echo in time")
        .unwrap();
    assert_eq!(&echo, b"ping");
    assert_eq!(harness.state.open_tunnels(), 1);

    drop(stream);
    for _ in 0..40 {
        if harness.state.open_tunnels() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(harness.state.open_tunnels(), 0);
    assert!(harness.state.is_up());
}

#[tokio::test]
async fn test_open_tunnel_keeps_project_awake() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    let harness = start_proxy(&orchestrator, upgrade_upstream().await, true).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = IdleMonitor::new(
        Arc::clone(&harness.state),
        service_group(&orchestrator),
        Duration::from_millis(300),
        Duration::from_millis(100),
    );
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    let (mut stream, head, _) = open_tunnel(harness.port, "/ws").await;
    assert_eq!(status_of(&head), 101);

    // Traffic flows only inside the tunnel, well past the idle threshold
    let mut chunk = [0u8; 64];
    for _ in 0..20 {
        stream.write_all(b"ping").await.unwrap();
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(harness.state.is_up());
    assert_eq!(orchestrator.stops(), 0);

    // Once the tunnel is gone the project goes to sleep as usual
    drop(stream);
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!harness.state.is_up());
    assert_eq!(orchestrator.stops(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), monitor_handle)
        .await
        .expect("monitor should stop")
        .unwrap();
}

// ============================================================================
// Administrative endpoints
// ============================================================================

#[tokio::test]
async fn test_manual_shutdown_stops_everything() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    orchestrator.add("worker", RunState::Running, None);
    let harness = start_proxy(&orchestrator, mock_upstream().await, true).await;

    let response = http_request(harness.port, "POST", "/sleep-proxy/shutdown").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(body_of(&response).contains(r#""status":"success""#));
    assert!(body_of(&response).contains(r#""message":"Containers stopped""#));

    assert!(!harness.state.is_up());
    assert_eq!(orchestrator.stops(), 2);
    assert_eq!(orchestrator.state_of("worker"), Some(RunState::Stopped));
}

#[tokio::test]
async fn test_manual_shutdown_failure_still_marks_down() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    orchestrator
        .fail_list
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let harness = start_proxy(&orchestrator, mock_upstream().await, true).await;

    let response = http_get(harness.port, "/sleep-proxy/shutdown").await.unwrap();
    assert_eq!(status_of(&response), 500);
    assert!(response.contains("STOP_FAILED"));
    assert!(!harness.state.is_up());

    let response = http_request(harness.port, "PUT", "/sleep-proxy/shutdown").await.unwrap();
    assert_eq!(status_of(&response), 405);
}

#[tokio::test]
async fn test_status_and_static_assets() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    let harness = start_proxy(&orchestrator, mock_upstream().await, true).await;

    let response = http_get(harness.port, "/sleep-proxy/status").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let json: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(json["group"], "shop");
    assert_eq!(json["up"], true);
    assert_eq!(json["name"], "sleepgate");

    let response = http_get(harness.port, "/static/loading.js").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(response.to_ascii_lowercase().contains("content-type: application/javascript"));

    let response = http_get(harness.port, "/static/loading.css").await.unwrap();
    assert_eq!(status_of(&response), 200);

    let response = http_get(harness.port, "/static/nope.txt").await.unwrap();
    assert_eq!(status_of(&response), 404);
}

// ============================================================================
// Idle lifecycle
// ============================================================================

#[tokio::test]
async fn test_idle_project_is_put_to_sleep() {
    let orchestrator = MemoryOrchestrator::new();
    orchestrator.add("web", RunState::Running, None);
    let state = GatewayState::new(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = IdleMonitor::new(
        Arc::clone(&state),
        service_group(&orchestrator),
        Duration::from_millis(300),
        Duration::from_millis(100),
    );
    let handle = tokio::spawn(monitor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!state.is_up());
    assert_eq!(orchestrator.state_of("web"), Some(RunState::Stopped));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor should stop")
        .unwrap();
}

#[tokio::test]
async fn test_server_stops_on_shutdown_signal() {
    let orchestrator = MemoryOrchestrator::new();
    let harness = start_proxy(&orchestrator, mock_upstream().await, false).await;

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), harness.server)
        .await
        .expect("server should stop")
        .unwrap();
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let toml = r#"
proxy_port = 8080
bind = "127.0.0.1"
target_service = "storefront"
target_port = 3000
sleep_timeout_secs = 1800
check_interval_secs = 10
endpoint_prefix = "_sleep"
exclusion_label = "shop.keep-awake"
project_name = "shop"
probe_path = "/healthz"
probe_timeout_ms = 1500
stop_grace_period_secs = 20
"#;

    let config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.proxy_port, 8080);
    assert_eq!(config.target_authority(), "storefront:3000");
    assert_eq!(config.sleep_timeout(), Duration::from_secs(1800));
    assert_eq!(config.check_interval(), Duration::from_secs(10));
    assert_eq!(config.probe_timeout(), Duration::from_millis(1500));
    assert_eq!(config.stop_grace_period(), Duration::from_secs(20));
    assert_eq!(config.project_name.as_deref(), Some("shop"));

    let options = GatewayOptions::from_config(&config);
    assert_eq!(options.endpoint_prefix, "_sleep");
    assert_eq!(options.poll_interval, Duration::from_secs(10));
    assert_eq!(options.probe_path, "/healthz");
}
