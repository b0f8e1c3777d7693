//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Stream control (start / stop / status)
//! - Event queries and status transitions
//! - WebSocket push of event transitions
//! - Health check

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_connected = state.events.is_healthy().await;
    let active_streams = state
        .registry
        .list()
        .await
        .iter()
        .filter(|s| s.active)
        .count();

    let response = HealthResponse {
        status: if db_connected { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.uptime_sec(),
        active_streams,
        db_connected,
    };

    Json(response)
}
