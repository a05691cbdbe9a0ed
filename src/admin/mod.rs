//! Admin HTTP API using Axum.
//!
//! Provides endpoints for:
//! - Health checks (/healthz, /livez, /readyz)
//! - Metrics (/metrics)
//! - Traffic stats (/stats)
//! - Verdict lookup (/verdicts/:ip)

mod handlers;
mod server;

pub use handlers::{
    health_handler, metrics_handler, stats_handler, verdict_handler, HealthResponse,
    StatsResponse, VerdictResponse,
};
pub use server::{AdminServer, AdminState};
