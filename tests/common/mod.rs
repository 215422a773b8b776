//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sleepgate::orchestrator::{
    ContainerInspection, ContainerRef, HealthStatus, Orchestrator, OrchestratorError, RunState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-memory stand-in for the Docker daemon
#[derive(Default)]
pub struct MemoryOrchestrator {
    containers: Mutex<Vec<ContainerRef>>,
    pub fail_list: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MemoryOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, name: &str, run_state: RunState, health: Option<HealthStatus>) {
        self.containers.lock().push(ContainerRef {
            id: format!("{}-id", name),
            name: name.to_string(),
            run_state,
            health,
        });
    }

    pub fn set_state(&self, name: &str, run_state: RunState) {
        if let Some(c) = self.containers.lock().iter_mut().find(|c| c.name == name) {
            c.run_state = run_state;
        }
    }

    pub fn state_of(&self, name: &str) -> Option<RunState> {
        self.containers
            .lock()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.run_state.clone())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn list_members(
        &self,
        _group: &str,
        _exclude_label: &str,
    ) -> Result<Vec<ContainerRef>, OrchestratorError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Unavailable("daemon unreachable".to_string()));
        }
        Ok(self.containers.lock().clone())
    }

    async fn start(&self, container_id: &str) -> Result<(), OrchestratorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock();
        let c = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| OrchestratorError::NotFound(container_id.to_string()))?;
        c.run_state = RunState::Running;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace_period: Duration) -> Result<(), OrchestratorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(c) = self.containers.lock().iter_mut().find(|c| c.id == container_id) {
            c.run_state = RunState::Stopped;
        }
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, OrchestratorError> {
        self.containers
            .lock()
            .iter()
            .find(|c| c.id == container_id)
            .map(|c| ContainerInspection {
                run_state: c.run_state.clone(),
                health: c.health,
            })
            .ok_or_else(|| OrchestratorError::NotFound(container_id.to_string()))
    }

    async fn inspect_self(&self, _host_identity: &str) -> Result<String, OrchestratorError> {
        Ok("shop".to_string())
    }
}

/// Mock target service. Answers every request with a fixed body, except
/// `/boom` which gets its connection dropped.
pub async fn mock_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = match stream.read(&mut buf).await {
                    Ok(n) if n > 0 => n,
                    _ => return,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                if request.starts_with("GET /boom") {
                    return;
                }
                let body = "hello from upstream";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr.to_string()
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and return the raw response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

pub async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path).await
}

/// Status code from a raw response
pub fn status_of(response: &str) -> u16 {
    response
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Body of a raw response
pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

/// Mock target that accepts WebSocket upgrades. It greets with `welcome`
/// right behind the 101 head, then echoes every byte. Plain requests (the
/// readiness probe) get a 200.
pub async fn upgrade_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some((head, _)) = read_head(&mut stream).await else {
                    return;
                };
                if !head.to_ascii_lowercase().contains("upgrade: websocket") {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    return;
                }

                let greeting = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nwelcome";
                if stream.write_all(greeting).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr.to_string()
}

/// Read up to the blank line ending an HTTP head. Returns the head and any
/// bytes already received after it.
pub async fn read_head(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Some((String::from_utf8_lossy(&buf).to_string(), rest));
        }
    }
}

/// Open a WebSocket upgrade through the proxy. Returns the stream, the
/// response head, and bytes that followed the head.
pub async fn open_tunnel(port: u16, path: &str) -> (TcpStream, String, Vec<u8>) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, rest) = read_head(&mut stream).await.expect("upgrade response head");
    (stream, head, rest)
}
