//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;

/// Detailed health information as JSON.
///
/// Always returns 200; the `state` and `overloaded` fields say whether the
/// server is actually taking work.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();
    let load = state.app.load();
    let lag_ms = u64::try_from(load.current_lag().as_millis()).unwrap_or(u64::MAX);

    Json(json!({
        "state": health.as_str(),
        "connections": state.registry.count(),
        "in_flight": state.shutdown.in_flight_count(),
        "lag_ms": lag_ms,
        "overloaded": load.is_overloaded(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe. Always 200 while the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. 200 when ready, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
