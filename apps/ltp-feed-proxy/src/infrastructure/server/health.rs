//! Health, readiness and metrics handlers.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::application::services::registry::RegistryStats;
use crate::domain::market::FeedState;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::supervisor::SupervisorSnapshot;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Supervisor, poller and primary feed state.
    pub feed: SupervisorSnapshot,
    /// Client and subscription counts.
    pub registry: RegistryStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Poller alive and primary connected (or not deployed).
    Healthy,
    /// Serving from fallback only.
    Degraded,
    /// Feed DOWN or poller not running.
    Unhealthy,
}

impl HealthStatus {
    fn from_snapshot(supervisor_healthy: bool, feed: &SupervisorSnapshot) -> Self {
        if !supervisor_healthy {
            return Self::Unhealthy;
        }
        match &feed.primary {
            Some(primary) if primary.state != FeedState::Connected => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

pub(super) async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.supervisor.is_healthy() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let feed = state.supervisor.snapshot();
    let status = HealthStatus::from_snapshot(state.supervisor.is_healthy(), &feed);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        registry: state.registry.stats(),
    }
}
