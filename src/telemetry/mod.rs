//! Logging, tracing and metrics.

mod metrics;
mod tracing;

pub use self::metrics::{counters, Metrics, Stats, StatsSnapshot};
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
