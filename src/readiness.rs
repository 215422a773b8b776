//! Readiness of the managed project
//!
//! A container reported as running is not necessarily serving: its
//! application may still be booting, or may have crashed without the process
//! exiting. Readiness therefore requires both the container checks and an
//! HTTP probe against the target to pass. Any error fails closed.

use crate::orchestrator::{HealthStatus, ServiceGroup};
use crate::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why the project is not ready, for logging and the status endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    ListFailed,
    NoMembers,
    NotRunning { container: String },
    InspectFailed { container: String },
    Unhealthy { container: String, health: HealthStatus },
    ProbeFailed,
}

/// Decides whether traffic can be forwarded to the project
pub struct ReadinessChecker {
    group: ServiceGroup,
    pool: Arc<ConnectionPool>,
    probe_path: String,
    probe_timeout: Duration,
}

impl ReadinessChecker {
    pub fn new(
        group: ServiceGroup,
        pool: Arc<ConnectionPool>,
        probe_path: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            group,
            pool,
            probe_path: probe_path.into(),
            probe_timeout,
        }
    }

    pub async fn is_ready(&self) -> bool {
        match self.check().await {
            Ok(()) => true,
            Err(reason) => {
                debug!(group = self.group.key(), ?reason, "Project not ready");
                false
            }
        }
    }

    /// Run every check in order, stopping at the first failure
    pub async fn check(&self) -> Result<(), NotReady> {
        let members = match self.group.members().await {
            Ok(members) => members,
            Err(e) => {
                warn!(group = self.group.key(), error = %e, "Failed to list project containers");
                return Err(NotReady::ListFailed);
            }
        };

        if members.is_empty() {
            return Err(NotReady::NoMembers);
        }

        for member in &members {
            if !member.run_state.is_running() {
                return Err(NotReady::NotRunning {
                    container: member.name.clone(),
                });
            }

            let inspection = match self.group.inspect(&member.id).await {
                Ok(inspection) => inspection,
                Err(e) => {
                    warn!(container = %member.name, error = %e, "Failed to inspect container");
                    return Err(NotReady::InspectFailed {
                        container: member.name.clone(),
                    });
                }
            };

            if !inspection.run_state.is_running() {
                return Err(NotReady::NotRunning {
                    container: member.name.clone(),
                });
            }

            // Containers without a healthcheck only need to be running
            if let Some(health) = inspection.health {
                if health != HealthStatus::Healthy {
                    return Err(NotReady::Unhealthy {
                        container: member.name.clone(),
                        health,
                    });
                }
            }
        }

        let outcome = self.pool.probe(&self.probe_path, self.probe_timeout).await;
        if outcome.is_ready() {
            Ok(())
        } else {
            debug!(upstream = self.pool.target(), ?outcome, "Application probe failed");
            Err(NotReady::ProbeFailed)
        }
    }
}
