use axum::extract::State;
use axum::{routing::get, Json, Router};
use kiln_comfyui::supervisor::ReadinessState;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Readiness of the rendering engine.
    pub engine_state: ReadinessState,
}

/// GET /health -- returns worker and engine status.
///
/// The worker itself is `ok` whenever it answers; a crashed engine
/// reports `degraded` because the next job will have to restart it.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine_state = state.engine_state.borrow().state;

    let status = match engine_state {
        ReadinessState::Crashed => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        engine_state,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
