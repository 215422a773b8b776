//! Docker implementation of the orchestrator contract

use crate::orchestrator::{
    ContainerInspection, ContainerRef, HealthStatus, Orchestrator, OrchestratorError, RunState,
};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::models::{ContainerStateStatusEnum, ContainerSummary, HealthStatusEnum};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Label docker compose puts on every container of a project
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Length of the short container id docker uses as the default hostname
const SHORT_ID_LEN: usize = 12;

/// Talks to the Docker daemon on behalf of the proxy
pub struct DockerOrchestrator {
    client: Docker,
    /// Our own container id (or hostname), excluded from every listing
    self_id: Option<String>,
}

impl DockerOrchestrator {
    /// Connect to the Docker daemon and verify it responds
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's default local socket
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}.",
                    host, e
                )
            })?
        } else {
            Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Mount /var/run/docker.sock into the proxy container or set DOCKER_HOST.",
                    e
                )
            })?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon is not responding: {}", e)
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            self_id: None,
        })
    }

    /// Exclude the container identified by `id` (full id, short id or hostname)
    pub fn with_self_id(mut self, id: impl Into<String>) -> Self {
        self.self_id = Some(id.into());
        self
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn is_self(&self, container_id: &str) -> bool {
        self.self_id
            .as_deref()
            .map(|own| same_container(own, container_id))
            .unwrap_or(false)
    }
}

/// Whether two container ids refer to the same container, allowing one of
/// them to be the 12-character short form
fn same_container(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    a.len() >= SHORT_ID_LEN
        && b.len() >= SHORT_ID_LEN
        && a.as_bytes()[..SHORT_ID_LEN] == b.as_bytes()[..SHORT_ID_LEN]
}

/// Display name of a listed container, without docker's leading slash
fn display_name(summary: &ContainerSummary, id: &str) -> String {
    summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(SHORT_ID_LEN).collect())
}

/// Health as shown in the listing status, e.g. "Up 3 minutes (healthy)"
fn health_from_status(status: Option<&str>) -> Option<HealthStatus> {
    let status = status?;
    if status.contains("(healthy)") {
        Some(HealthStatus::Healthy)
    } else if status.contains("(unhealthy)") {
        Some(HealthStatus::Unhealthy)
    } else if status.contains("(health: starting)") {
        Some(HealthStatus::Starting)
    } else {
        None
    }
}

fn api_error(e: bollard::errors::Error) -> OrchestratorError {
    OrchestratorError::Unavailable(e.to_string())
}

fn run_state_from_enum(status: Option<ContainerStateStatusEnum>) -> RunState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => RunState::Running,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => RunState::Stopped,
        Some(other) => RunState::Other(other.to_string()),
        None => RunState::Other("unknown".to_string()),
    }
}

fn health_from_enum(status: Option<HealthStatusEnum>) -> Option<HealthStatus> {
    match status? {
        HealthStatusEnum::HEALTHY => Some(HealthStatus::Healthy),
        HealthStatusEnum::UNHEALTHY => Some(HealthStatus::Unhealthy),
        HealthStatusEnum::STARTING => Some(HealthStatus::Starting),
        HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => None,
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn list_members(
        &self,
        group: &str,
        exclude_label: &str,
    ) -> Result<Vec<ContainerRef>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, group)],
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(api_error)?;

        let mut members = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            let Some(id) = summary.id.as_deref() else {
                continue;
            };
            if self.is_self(id) {
                continue;
            }

            let name = display_name(summary, id);
            let excluded = summary
                .labels
                .as_ref()
                .map(|labels| labels.contains_key(exclude_label))
                .unwrap_or(false);
            if excluded {
                debug!(container = %name, label = exclude_label, "Excluding container");
                continue;
            }

            members.push(ContainerRef {
                id: id.to_string(),
                name,
                run_state: RunState::from_runtime(summary.state.as_deref().unwrap_or("unknown")),
                health: health_from_status(summary.status.as_deref()),
            });
        }

        Ok(members)
    }

    async fn start(&self, container_id: &str) -> Result<(), OrchestratorError> {
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already running");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(OrchestratorError::NotFound(container_id.to_string())),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<(), OrchestratorError> {
        let options = StopContainerOptions {
            t: grace_period.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Removed since it was listed; nothing left to stop
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(api_error(e)),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, OrchestratorError> {
        let info = match self.client.inspect_container(container_id, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(OrchestratorError::NotFound(container_id.to_string())),
            Err(e) => return Err(api_error(e)),
        };

        let state = info.state.unwrap_or_default();
        Ok(ContainerInspection {
            run_state: run_state_from_enum(state.status),
            health: health_from_enum(state.health.and_then(|h| h.status)),
        })
    }

    async fn inspect_self(&self, host_identity: &str) -> Result<String, OrchestratorError> {
        let info = match self.client.inspect_container(host_identity, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(OrchestratorError::NotFound(host_identity.to_string())),
            Err(e) => return Err(api_error(e)),
        };

        let project = info
            .config
            .and_then(|c| c.labels)
            .and_then(|labels| labels.get(COMPOSE_PROJECT_LABEL).cloned())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| OrchestratorError::MissingLabel {
                container: host_identity.to_string(),
                label: COMPOSE_PROJECT_LABEL.to_string(),
            })?;

        info!(container = host_identity, project = %project, "Resolved compose project");
        Ok(project)
    }
}
