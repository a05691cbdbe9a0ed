use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::engine::Evaluation;

/// Process-wide traffic totals, shared by every proxy and read by `/stats`.
#[derive(Debug, Default)]
pub struct Stats {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub upstream_errors: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record(&self, evaluation: &Evaluation) {
        if evaluation.is_accepted() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

/// OTEL metrics with a Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
}

impl Metrics {
    /// Build the OTEL → Prometheus pipeline and register the counters.
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let exporter = exporter()
            .with_registry(registry.clone())
            .build()
            .context("can't build prometheus exporter")?;

        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

        opentelemetry::global::set_meter_provider(meter_provider.clone());
        counters::init(&meter_provider.meter("bounced"));

        info!("OTEL metrics configured with Prometheus exporter");

        Ok(Arc::new(Self {
            registry,
            meter_provider,
        }))
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("can't encode metrics")?;

        String::from_utf8(buffer).context("metrics output is not UTF-8")
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// bounced_* counters. Every recorder is a no-op until [`init`] ran.
pub mod counters {
    use opentelemetry::metrics::{Counter, Histogram};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ========================================================================
    // ENGINE
    // ========================================================================

    static EVALUATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static EVALUATION_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();
    static FILTER_APPLIED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static FILTER_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ========================================================================
    // STORE
    // ========================================================================

    static STORE_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static STORE_PRUNED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ========================================================================
    // PROXY
    // ========================================================================

    static CONNECTIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static ACTIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static UPSTREAM_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    /// Register every instrument on `meter`.
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = EVALUATIONS_TOTAL.set(
            meter
                .u64_counter("bounced_evaluations_total")
                .with_description("Filter chain evaluations by proxy and result")
                .build(),
        );
        let _ = EVALUATION_DURATION.set(
            meter
                .f64_histogram("bounced_evaluation_duration_seconds")
                .with_description("Time spent evaluating one entity")
                .build(),
        );
        let _ = FILTER_APPLIED_TOTAL.set(
            meter
                .u64_counter("bounced_filter_applied_total")
                .with_description("Filter applications by outcome")
                .build(),
        );
        let _ = FILTER_ERRORS_TOTAL.set(
            meter
                .u64_counter("bounced_filter_errors_total")
                .with_description("Filter failures by phase")
                .build(),
        );

        let _ = STORE_ERRORS_TOTAL.set(
            meter
                .u64_counter("bounced_store_errors_total")
                .with_description("Verdict store failures by operation")
                .build(),
        );
        let _ = STORE_PRUNED_TOTAL.set(
            meter
                .u64_counter("bounced_store_pruned_total")
                .with_description("Verdict records removed by retention")
                .build(),
        );

        let _ = CONNECTIONS_TOTAL.set(
            meter
                .u64_counter("bounced_connections_total")
                .with_description("Inbound connections by proxy")
                .build(),
        );
        let _ = ACTIONS_TOTAL.set(
            meter
                .u64_counter("bounced_actions_total")
                .with_description("Actions taken on filtered entities")
                .build(),
        );
        let _ = UPSTREAM_ERRORS_TOTAL.set(
            meter
                .u64_counter("bounced_upstream_errors_total")
                .with_description("Backend failures by kind")
                .build(),
        );
    }

    pub fn evaluation(proxy: &str, result: &str, duration_secs: f64) {
        if let Some(c) = EVALUATIONS_TOTAL.get() {
            c.add(1, &[kv("proxy", proxy), kv("result", result)]);
        }
        if let Some(h) = EVALUATION_DURATION.get() {
            h.record(duration_secs, &[kv("proxy", proxy)]);
        }
    }

    pub fn filter_applied(proxy: &str, filter: &str, outcome: &str) {
        if let Some(c) = FILTER_APPLIED_TOTAL.get() {
            c.add(
                1,
                &[kv("proxy", proxy), kv("filter", filter), kv("outcome", outcome)],
            );
        }
    }

    pub fn filter_error(proxy: &str, filter: &str, phase: &str) {
        if let Some(c) = FILTER_ERRORS_TOTAL.get() {
            c.add(
                1,
                &[kv("proxy", proxy), kv("filter", filter), kv("phase", phase)],
            );
        }
    }

    pub fn store_error(operation: &str) {
        if let Some(c) = STORE_ERRORS_TOTAL.get() {
            c.add(1, &[kv("operation", operation)]);
        }
    }

    pub fn store_pruned(count: u64) {
        if let Some(c) = STORE_PRUNED_TOTAL.get() {
            c.add(count, &[]);
        }
    }

    pub fn connection_opened(proxy: &str, protocol: &str) {
        if let Some(c) = CONNECTIONS_TOTAL.get() {
            c.add(1, &[kv("proxy", proxy), kv("protocol", protocol)]);
        }
    }

    pub fn action_taken(proxy: &str, action: &str) {
        if let Some(c) = ACTIONS_TOTAL.get() {
            c.add(1, &[kv("proxy", proxy), kv("action", action)]);
        }
    }

    pub fn upstream_error(proxy: &str, kind: &str) {
        if let Some(c) = UPSTREAM_ERRORS_TOTAL.get() {
            c.add(1, &[kv("proxy", proxy), kv("kind", kind)]);
        }
    }

    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = Stats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record(&Evaluation::Accepted);
        stats.record(&Evaluation::RejectedByThreshold);
        stats.record(&Evaluation::Allowlisted);
        stats.upstream_error();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                active_connections: 1,
                total_connections: 2,
                accepted: 2,
                rejected: 1,
                upstream_errors: 1,
            }
        );
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        counters::evaluation("web", "accepted", 0.001);

        let output = metrics.render().unwrap();
        assert!(output.contains("bounced_evaluations_total"));
    }
}
