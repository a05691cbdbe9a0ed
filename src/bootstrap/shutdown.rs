use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - listeners stopped, in-flight connections finishing
/// 3. Terminated - all connections closed or drain timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Coordinates graceful shutdown across listeners and the admin API.
pub struct ShutdownManager {
    state: watch::Sender<ShutdownState>,
    drain_period: Duration,
    active_connections: AtomicU64,
}

impl ShutdownManager {
    pub fn new(drain_period: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            drain_period,
            active_connections: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn drain_period(&self) -> Duration {
        self.drain_period
    }

    /// Stop accepting; terminates at once when nothing is in flight.
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(
            drain_period_secs = self.drain_period.as_secs(),
            active_connections = self.active_connections(),
            "starting graceful shutdown drain"
        );

        self.state.send_replace(ShutdownState::Draining);

        if self.active_connections() == 0 {
            self.terminate();
        }
    }

    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        let active = self.active_connections();
        if active > 0 {
            warn!(
                active_connections = active,
                "force terminating with active connections"
            );
        }

        info!("shutdown complete");
        self.state.send_replace(ShutdownState::Terminated);
    }

    /// Drain, then wait up to the drain period for in-flight connections.
    pub async fn drain(&self) {
        self.start_drain();

        let mut rx = self.subscribe();
        let drained = tokio::time::timeout(self.drain_period, async {
            while *rx.borrow_and_update() != ShutdownState::Terminated {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                active_connections = self.active_connections(),
                "drain timeout reached, forcing shutdown"
            );
        }

        self.terminate();
    }

    /// Register a connection. `None` once draining started.
    pub fn track(self: &Arc<Self>) -> Option<DrainGuard> {
        if self.state() != ShutdownState::Running {
            return None;
        }

        self.active_connections.fetch_add(1, Ordering::SeqCst);
        Some(DrainGuard {
            manager: self.clone(),
        })
    }

    fn connection_closed(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);

        if self.state() == ShutdownState::Draining && prev == 1 {
            self.terminate();
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}

/// Keeps one connection counted until dropped.
pub struct DrainGuard {
    manager: Arc<ShutdownManager>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.manager.connection_closed();
    }
}
