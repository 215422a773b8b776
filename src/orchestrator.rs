//! Orchestrator contract and service-group operations
//!
//! The proxy never talks to a container runtime directly; it goes through the
//! [`Orchestrator`] trait. [`ServiceGroup`] layers the best-effort group
//! semantics on top: list members on every call, act on each one, log and
//! count per-member failures instead of aborting.

use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors returned by orchestrator calls
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container '{container}' has no '{label}' label")]
    MissingLabel { container: String, label: String },
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// Run state of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    /// Any other runtime state (created, paused, restarting, ...)
    Other(String),
}

impl RunState {
    /// Map a runtime state string ("running", "exited", ...) to a run state
    pub fn from_runtime(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => RunState::Running,
            "exited" | "stopped" | "dead" => RunState::Stopped,
            other => RunState::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Stopped => write!(f, "stopped"),
            RunState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Health reported by a container's own healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A member of the managed project, as seen at listing time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub run_state: RunState,
    /// `None` when the container defines no healthcheck
    pub health: Option<HealthStatus>,
}

/// Result of inspecting a single container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    pub run_state: RunState,
    pub health: Option<HealthStatus>,
}

/// Operations the proxy needs from a container runtime
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List members of `group`, excluding the proxy's own container and any
    /// container carrying `exclude_label`
    async fn list_members(
        &self,
        group: &str,
        exclude_label: &str,
    ) -> Result<Vec<ContainerRef>, OrchestratorError>;

    /// Start a container. Starting a running container is not an error.
    async fn start(&self, container_id: &str) -> Result<(), OrchestratorError>;

    /// Stop a container, waiting up to `grace_period` before it is killed.
    /// Stopping a stopped container is not an error.
    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<(), OrchestratorError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, OrchestratorError>;

    /// Resolve the group the container named `host_identity` belongs to
    async fn inspect_self(&self, host_identity: &str) -> Result<String, OrchestratorError>;
}

pub type SharedOrchestrator = Arc<dyn Orchestrator>;

/// Outcome of a start-all or stop-all pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GroupReport {
    /// Members in the group at listing time
    pub members: usize,
    /// Members acted on
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl GroupReport {
    /// Nothing that was attempted went through
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }
}

/// The set of containers managed as one unit
#[derive(Clone)]
pub struct ServiceGroup {
    orchestrator: SharedOrchestrator,
    key: String,
    exclusion_label: String,
    stop_grace_period: Duration,
}

impl ServiceGroup {
    pub fn new(
        orchestrator: SharedOrchestrator,
        key: impl Into<String>,
        exclusion_label: impl Into<String>,
        stop_grace_period: Duration,
    ) -> Self {
        Self {
            orchestrator,
            key: key.into(),
            exclusion_label: exclusion_label.into(),
            stop_grace_period,
        }
    }

    /// The group identifier (compose project name)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current members, recomputed from the orchestrator
    pub async fn members(&self) -> Result<Vec<ContainerRef>, OrchestratorError> {
        self.orchestrator
            .list_members(&self.key, &self.exclusion_label)
            .await
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, OrchestratorError> {
        self.orchestrator.inspect(container_id).await
    }

    /// True when the group has members and every one of them is running
    pub async fn all_running(&self) -> Result<bool, OrchestratorError> {
        let members = self.members().await?;
        Ok(!members.is_empty() && members.iter().all(|c| c.run_state.is_running()))
    }

    /// Start every member that is not running.
    ///
    /// Only a listing failure is returned as an error; per-member failures are
    /// logged and counted in the report.
    pub async fn start_all(&self) -> Result<GroupReport, OrchestratorError> {
        let members = self.members().await?;
        let pending: Vec<&ContainerRef> = members.iter().filter(|c| !c.run_state.is_running()).collect();

        info!(
            group = %self.key,
            members = members.len(),
            to_start = pending.len(),
            "Starting project containers"
        );

        let results = join_all(pending.iter().map(|c| async move {
            debug!(container = %c.name, state = %c.run_state, "Starting container");
            let result = self.orchestrator.start(&c.id).await;
            match &result {
                Ok(()) => info!(container = %c.name, "Started container"),
                Err(e) => warn!(container = %c.name, error = %e, "Failed to start container"),
            }
            result.is_ok()
        }))
        .await;

        Ok(tally(members.len(), &results))
    }

    /// Stop every running member, same error policy as [`start_all`](Self::start_all)
    pub async fn stop_all(&self) -> Result<GroupReport, OrchestratorError> {
        let members = self.members().await?;
        let running: Vec<&ContainerRef> = members.iter().filter(|c| c.run_state.is_running()).collect();

        info!(
            group = %self.key,
            members = members.len(),
            to_stop = running.len(),
            "Stopping project containers"
        );

        let grace = self.stop_grace_period;
        let results = join_all(running.iter().map(|c| async move {
            debug!(container = %c.name, "Stopping container");
            let result = self.orchestrator.stop(&c.id, grace).await;
            match &result {
                Ok(()) => info!(container = %c.name, "Stopped container"),
                Err(e) => warn!(container = %c.name, error = %e, "Failed to stop container"),
            }
            result.is_ok()
        }))
        .await;

        Ok(tally(members.len(), &results))
    }
}

fn tally(members: usize, results: &[bool]) -> GroupReport {
    let succeeded = results.iter().filter(|ok| **ok).count();
    GroupReport {
        members,
        attempted: results.len(),
        succeeded,
        failed: results.len() - succeeded,
    }
}
