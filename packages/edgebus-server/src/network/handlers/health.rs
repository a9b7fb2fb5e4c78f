//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Detailed health as JSON. Always 200; `state` carries the verdict.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();

    Json(json!({
        "state": health.as_str(),
        "endpoints": state.endpoints.len(),
        "connections": state.endpoints.consumer_count(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness check: 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check: 200 when Ready, 503 while starting or shutting down.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
