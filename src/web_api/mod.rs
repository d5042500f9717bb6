//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Health and aggregate statistics
//! - Per-source status, start/stop and config hot-swap
//! - Recent analysis events
//!
//! Source records themselves come from the sources file; there is no
//! create/delete over HTTP.

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let vision = state.vision.health().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.uptime().as_secs(),
        vision,
    };

    Json(response)
}
