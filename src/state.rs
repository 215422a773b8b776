//! Shared lifecycle state for the managed project
//!
//! Two pieces of process-wide state drive every decision the proxy makes:
//! when traffic was last seen, and whether the project is believed to be up.
//! Both sit behind read-write locks so the health endpoint and the idle
//! monitor can read concurrently while request handlers write.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Timestamp of the most recently observed request
#[derive(Debug)]
pub struct ActivityClock {
    last_activity: RwLock<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record that traffic was observed now
    pub fn record_activity(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.write();
        // Callers race to take the write lock; a slower caller must not pull
        // the clock back to an instant it sampled earlier.
        if now > *last {
            *last = now;
        }
    }

    /// Instant of the last recorded activity
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Time elapsed since the last recorded activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the project's containers are believed to be running
#[derive(Debug)]
pub struct LifecycleState {
    up: RwLock<bool>,
}

impl LifecycleState {
    pub fn new(up: bool) -> Self {
        Self { up: RwLock::new(up) }
    }

    pub fn is_up(&self) -> bool {
        *self.up.read()
    }

    pub fn mark_up(&self) {
        *self.up.write() = true;
    }

    pub fn mark_down(&self) {
        *self.up.write() = false;
    }

    /// Flip down to up, returning true only for the caller that made the flip.
    ///
    /// Requests that arrive while the project is down all race here; exactly
    /// one wins and is responsible for issuing the start commands.
    pub fn try_begin_start(&self) -> bool {
        let mut up = self.up.write();
        if *up {
            return false;
        }
        *up = true;
        true
    }
}

/// State shared by the dispatcher, the health endpoints and the idle monitor
#[derive(Debug)]
pub struct GatewayState {
    activity: ActivityClock,
    lifecycle: LifecycleState,
    /// Upgraded connections currently relayed to the target
    open_tunnels: AtomicUsize,
}

/// Handle passed to every component
pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Create the shared state. Activity starts at "now" so a freshly started
    /// proxy does not immediately put a running project to sleep.
    pub fn new(initially_up: bool) -> SharedState {
        Arc::new(Self {
            activity: ActivityClock::new(),
            lifecycle: LifecycleState::new(initially_up),
            open_tunnels: AtomicUsize::new(0),
        })
    }

    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }

    pub fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    pub fn record_activity(&self) {
        self.activity.record_activity();
    }

    pub fn idle_duration(&self) -> Duration {
        self.activity.idle_duration()
    }

    pub fn is_up(&self) -> bool {
        self.lifecycle.is_up()
    }

    pub fn mark_up(&self) {
        self.lifecycle.mark_up();
    }

    pub fn mark_down(&self) {
        self.lifecycle.mark_down();
    }

    pub fn try_begin_start(&self) -> bool {
        self.lifecycle.try_begin_start()
    }

    /// Track a tunnel that just opened. While any tunnel is open the project
    /// counts as active regardless of the idle clock.
    pub fn tunnel_opened(&self) {
        self.open_tunnels.fetch_add(1, Ordering::SeqCst);
    }

    /// Track a tunnel that closed; its last byte counts as activity
    pub fn tunnel_closed(&self) {
        self.record_activity();
        let _ = self
            .open_tunnels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn open_tunnels(&self) -> usize {
        self.open_tunnels.load(Ordering::SeqCst)
    }
}
