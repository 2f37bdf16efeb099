//! Reading intake endpoint.
//!
//! `POST /readings` queues a reading for background evaluation and answers
//! `202 Accepted`. With `?wait=true` the reading is evaluated inline and the
//! outcome is returned.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ApiError, ApiJson, ApiQuery};
use crate::app::AppState;
use crate::models::RawReading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", post(handler))
}

/// Query parameters for reading intake
#[derive(Debug, Default, Deserialize)]
struct IngestParams {
    #[serde(default)]
    wait: bool,
}

async fn handler(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<IngestParams>,
    ApiJson(raw): ApiJson<RawReading>,
) -> Result<Response, ApiError> {
    // ---
    debug!(metric = %raw.metric_type, value = raw.value, wait = params.wait, "POST /readings");

    if params.wait {
        let outcome = state.ingester.process(&raw).await?;
        return Ok(Json(outcome).into_response());
    }

    state.ingester.ingest(&raw)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response())
}
