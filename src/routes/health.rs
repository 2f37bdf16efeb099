//! Liveness endpoint for container orchestrators and CI.
//!
//! `GET /health` answers without touching storage so a slow database never
//! makes the process look dead; it only reports which backend is wired in.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::app::AppState;
use crate::config::StorageBackend;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    storage: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // ---
    let storage = match state.config.storage {
        StorageBackend::Postgres => "postgres",
        StorageBackend::Memory => "memory",
    };
    Json(HealthResponse {
        status: "ok",
        storage,
    })
}

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
