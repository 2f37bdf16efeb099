//! Rule administration endpoints.
//!
//! Rules are never hard-deleted: `DELETE /rules/{id}` only deactivates.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use super::{ApiError, ApiJson, ApiPath};
use crate::app::AppState;
use crate::models::{Rule, RuleDraft};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/rules", get(list_rules).post(upsert_rule))
        .route(
            "/rules/{id}",
            get(get_rule).put(update_rule).delete(deactivate_rule),
        )
}

async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<Rule>>, ApiError> {
    Ok(Json(state.rules.list_rules().await?))
}

async fn get_rule(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Rule>, ApiError> {
    Ok(Json(state.rules.get_rule(id).await?))
}

/// `POST /rules`: insert without `id`, update with one.
async fn upsert_rule(
    State(state): State<AppState>,
    ApiJson(draft): ApiJson<RuleDraft>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let status = if draft.id.is_none() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let rule = state.rules.upsert_rule(draft).await?;
    Ok((status, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(mut draft): ApiJson<RuleDraft>,
) -> Result<Json<Rule>, ApiError> {
    // ---
    draft.id = Some(id);
    Ok(Json(state.rules.upsert_rule(draft).await?))
}

async fn deactivate_rule(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    state.rules.deactivate_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
