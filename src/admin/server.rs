//! Admin HTTP server.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::bootstrap::{ShutdownManager, ShutdownState};
use crate::config::AdminConfig;
use crate::store::SharedVerdictStore;
use crate::telemetry::{Metrics, Stats, StatsSnapshot};

use super::handlers::{
    health_handler, live_handler, metrics_handler, ready_handler, stats_handler, verdict_handler,
};

/// State shared by the admin handlers.
pub struct AdminState {
    start_time: Instant,
    healthy: AtomicBool,
    ready: AtomicBool,
    stats: Arc<Stats>,
    store: SharedVerdictStore,
    metrics: Option<Arc<Metrics>>,
}

impl AdminState {
    pub fn new(
        stats: Arc<Stats>,
        store: SharedVerdictStore,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            stats,
            store,
            metrics,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Ready once every proxy is listening.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &SharedVerdictStore {
        &self.store
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }
}

/// Admin HTTP server.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
    shutdown: Arc<ShutdownManager>,
}

impl AdminServer {
    pub fn new(config: &AdminConfig, state: Arc<AdminState>, shutdown: Arc<ShutdownManager>) -> Self {
        Self {
            config: config.clone(),
            state,
            shutdown,
        }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            // Kubernetes-style health endpoints
            .route("/healthz", get(health_handler))
            .route("/livez", get(live_handler))
            .route("/readyz", get(ready_handler))
            // Traffic and metrics
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            // Verdict cache
            .route("/verdicts/:ip", get(verdict_handler))
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve.
    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.address).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until shutdown starts draining.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let router = self.router();
        let mut shutdown_rx = self.shutdown.subscribe();

        info!(address = %listener.local_addr()?, "starting admin server");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while *shutdown_rx.borrow_and_update() == ShutdownState::Running {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("admin server shutting down");
            })
            .await
    }
}
