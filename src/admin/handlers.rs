//! Admin API handlers.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AdminState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: if state.is_healthy() { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if state.is_healthy() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Live handler (for Kubernetes).
pub async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready handler (for Kubernetes).
pub async fn ready_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Stats response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub connections: ConnectionStats,
    pub evaluations: EvaluationStats,
    pub upstream_errors: u64,
    pub store: StoreStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationStats {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: String,
    pub identities: usize,
}

/// Stats handler.
pub async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let stats = state.stats();

    Json(StatsResponse {
        uptime_seconds: state.uptime().as_secs(),
        connections: ConnectionStats {
            active: stats.active_connections,
            total: stats.total_connections,
        },
        evaluations: EvaluationStats {
            accepted: stats.accepted,
            rejected: stats.rejected,
        },
        upstream_errors: stats.upstream_errors,
        store: StoreStats {
            backend: state.store().name().to_string(),
            identities: state.store().len(),
        },
    })
}

/// Metrics handler (Prometheus format).
pub async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let content_type = [("content-type", "text/plain; version=0.0.4; charset=utf-8")];

    let Some(metrics) = state.metrics() else {
        return (StatusCode::OK, content_type, String::new());
    };

    match metrics.render() {
        Ok(output) => (StatusCode::OK, content_type, output),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            content_type,
            format!("Error encoding metrics: {:#}", e),
        ),
    }
}

/// Verdict record of one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    pub ip: String,
    pub accepts: u64,
    pub rejects: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Verdict lookup handler.
///
/// GET /verdicts/:ip - accept/reject counters of one identity
pub async fn verdict_handler(
    State(state): State<Arc<AdminState>>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    let ip = match ip.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("invalid address: {}", ip),
                }),
            )
                .into_response();
        }
    };

    match state.store().get_verdict(&ip) {
        Ok(verdict) => Json(VerdictResponse {
            ip,
            accepts: verdict.accepts,
            rejects: verdict.rejects,
        })
        .into_response(),
        Err(e) => {
            warn!(ip = %ip, error = %e, "verdict lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
