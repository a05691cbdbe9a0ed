use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, span, warn, Instrument, Level};

use crate::admin::{AdminServer, AdminState};
use crate::config::Config;
use crate::filter::FilterSet;
use crate::proxy::Proxy;
use crate::store::{create_store, MemoryVerdictStore, SharedVerdictStore};
use crate::telemetry::{counters, Metrics, Stats};

use super::shutdown::{ShutdownManager, ShutdownState};

/// Main bounced server
///
/// Components:
/// - Proxies: one accept loop per configured listener
/// - Admin API: health, stats, metrics and verdict lookup
/// - Retention task: prunes stale verdict records
/// - Shutdown manager: graceful drain with configurable timeout
pub struct Server {
    /// Configuration
    config: Arc<Config>,

    /// Config file path (for logs)
    config_path: PathBuf,

    /// Shutdown manager
    shutdown: Arc<ShutdownManager>,
}

/// Handles of a started server.
pub struct Running {
    store: SharedVerdictStore,
    admin: Option<Arc<AdminState>>,
    admin_address: Option<SocketAddr>,
    proxies: Vec<(String, SocketAddr)>,
    tasks: Vec<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    _metrics: Arc<Metrics>,
}

impl Running {
    /// Bound address of each proxy, by name.
    pub fn proxy_address(&self, name: &str) -> Option<SocketAddr> {
        self.proxies
            .iter()
            .find(|(proxy, _)| proxy == name)
            .map(|(_, address)| *address)
    }

    /// Bound admin address, when the admin API is enabled.
    pub fn admin_address(&self) -> Option<SocketAddr> {
        self.admin_address
    }

    pub fn store(&self) -> &SharedVerdictStore {
        &self.store
    }
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self> {
        let shutdown = ShutdownManager::new(config.shutdown.drain_timeout);

        Ok(Self {
            config: Arc::new(config),
            config_path,
            shutdown,
        })
    }

    /// Run the server until SIGINT or SIGTERM, then drain.
    pub async fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "bounced", version = env!("CARGO_PKG_VERSION"));

        async {
            let running = self.start().await?;
            wait_for_shutdown().await;
            info!("shutdown signal received, starting graceful shutdown");
            self.stop(running).await
        }
        .instrument(span)
        .await
    }

    /// Build every filter and proxy against a scratch store without binding.
    pub fn validate(&self) -> Result<()> {
        let filters = FilterSet::from_config(&self.config.filters).context("invalid filter")?;
        let store: SharedVerdictStore = Arc::new(MemoryVerdictStore::new());

        for config in &self.config.proxies {
            Proxy::new(config, &filters, store.clone())?;
        }

        Ok(())
    }

    /// Open the store, build every proxy and start serving.
    pub async fn start(&self) -> Result<Running> {
        info!(
            config = %self.config_path.display(),
            proxies = self.config.proxies.len(),
            filters = self.config.filters.len(),
            store = ?self.config.store.backend,
            "starting bounced server"
        );

        let metrics = Metrics::new()?;
        let stats = Stats::new();
        let store = create_store(&self.config.store).context("can't open verdict store")?;
        let filters = FilterSet::from_config(&self.config.filters).context("invalid filter")?;

        // Build everything before binding so a bad proxy fails startup cleanly.
        let mut proxies = Vec::with_capacity(self.config.proxies.len());
        for config in &self.config.proxies {
            let proxy = Proxy::new(config, &filters, store.clone())?;
            proxies.push(Arc::new(proxy));
        }

        let mut tasks = Vec::new();
        let mut bound = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            let listener = proxy.bind().await?;
            let address = listener.local_addr()?;
            bound.push((proxy.name().to_string(), address));

            tasks.push(tokio::spawn(proxy.run(
                listener,
                self.shutdown.clone(),
                stats.clone(),
            )));
        }

        let (admin, admin_address) = if self.config.admin.enabled {
            let state = Arc::new(AdminState::new(
                stats.clone(),
                store.clone(),
                Some(metrics.clone()),
            ));
            let listener = TcpListener::bind(self.config.admin.address)
                .await
                .with_context(|| {
                    format!("can't bind admin address {}", self.config.admin.address)
                })?;
            let address = listener.local_addr()?;

            let server = AdminServer::new(&self.config.admin, state.clone(), self.shutdown.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!(error = %e, "admin server failed");
                }
            }));

            (Some(state), Some(address))
        } else {
            (None, None)
        };

        let maintenance = self.config.store.retention.map(|retention| {
            tokio::spawn(enforce_retention(
                store.clone(),
                retention,
                self.config.store.maintenance_interval,
                self.shutdown.subscribe(),
            ))
        });

        if let Some(state) = &admin {
            state.set_ready(true);
        }

        info!(
            admin_address = ?admin_address,
            drain_timeout_secs = self.config.shutdown.drain_timeout.as_secs(),
            "bounced server started"
        );

        Ok(Running {
            store,
            admin,
            admin_address,
            proxies: bound,
            tasks,
            maintenance,
            _metrics: metrics,
        })
    }

    /// Drain in-flight connections, stop every task and flush the store.
    pub async fn stop(&self, running: Running) -> Result<()> {
        if let Some(state) = &running.admin {
            state.set_ready(false);
        }

        self.shutdown.drain().await;

        if let Some(handle) = running.maintenance {
            handle.abort();
        }

        for handle in running.tasks {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "task ended abnormally");
                }
            }
        }

        if let Err(e) = running.store.flush() {
            error!(error = %e, "can't flush verdict store");
        }

        crate::telemetry::shutdown_tracing();

        info!("bounced server stopped");

        Ok(())
    }

    /// Get shutdown manager
    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }
}

/// Prune stale verdicts every `interval` until shutdown starts.
async fn enforce_retention(
    store: SharedVerdictStore,
    retention: Duration,
    interval: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<ShutdownState>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.prune(retention) {
                    Ok(0) => {}
                    Ok(pruned) => {
                        info!(pruned, backend = store.name(), "pruned stale verdicts");
                        counters::store_pruned(pruned);
                    }
                    Err(e) => {
                        warn!(error = %e, "verdict pruning failed");
                        counters::store_error("prune");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() != ShutdownState::Running {
                    break;
                }
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "can't listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "can't install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retention_stops_on_drain() {
        let store: SharedVerdictStore = Arc::new(MemoryVerdictStore::new());
        let shutdown = ShutdownManager::new(Duration::from_secs(1));

        let handle = tokio::spawn(enforce_retention(
            store,
            Duration::from_secs(60),
            Duration::from_millis(10),
            shutdown.subscribe(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        shutdown.start_drain();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
