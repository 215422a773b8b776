//! Puts the project to sleep after a period without traffic

use crate::orchestrator::ServiceGroup;
use crate::state::SharedState;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Periodic idle check for the managed project
pub struct IdleMonitor {
    state: SharedState,
    group: ServiceGroup,
    idle_threshold: Duration,
    poll_interval: Duration,
}

/// What a single tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Project already down, nothing to do
    Down,
    /// Up, and traffic was seen within the threshold or a tunnel is open
    Active,
    /// Stop issued and state marked down
    Stopped,
    /// Idle, but the members could not be listed; retried next tick
    StopFailed,
}

impl IdleMonitor {
    pub fn new(
        state: SharedState,
        group: ServiceGroup,
        idle_threshold: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            group,
            idle_threshold,
            poll_interval,
        }
    }

    /// Run until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            group = self.group.key(),
            poll_interval_secs = self.poll_interval.as_secs(),
            idle_threshold_secs = self.idle_threshold.as_secs(),
            "Idle monitor started"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Idle monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate the idle rule once
    pub async fn tick(&self) -> TickOutcome {
        if !self.state.is_up() {
            return TickOutcome::Down;
        }

        let open_tunnels = self.state.open_tunnels();
        if open_tunnels > 0 {
            debug!(open_tunnels, "Project active, tunnels open");
            return TickOutcome::Active;
        }

        let idle = self.state.idle_duration();
        if idle <= self.idle_threshold {
            debug!(idle_secs = idle.as_secs(), "Project active");
            return TickOutcome::Active;
        }

        info!(
            group = self.group.key(),
            idle_secs = idle.as_secs(),
            threshold_secs = self.idle_threshold.as_secs(),
            "No activity within threshold, putting project to sleep"
        );

        match self.group.stop_all().await {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(
                        failed = report.failed,
                        stopped = report.succeeded,
                        "Some containers failed to stop"
                    );
                }
                self.state.mark_down();
                TickOutcome::Stopped
            }
            Err(e) => {
                error!(group = self.group.key(), error = %e, "Failed to stop project");
                TickOutcome::StopFailed
            }
        }
    }
}
