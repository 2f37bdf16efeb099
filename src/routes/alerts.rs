//! Read-only views over fired alerts and the automation log.

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{ApiError, ApiQuery};
use crate::app::AppState;
use crate::models::{AutomationLogEntry, Decision, FiredAlert};
use crate::store::{bounded, LogFilter};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/automation-logs", get(list_logs))
}

/// Query parameters for alert and log listings
#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    decision: Option<Decision>,
}

impl ListQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

async fn list_alerts(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ListQuery>,
) -> Result<Json<Vec<FiredAlert>>, ApiError> {
    // ---
    let alerts = bounded(
        "list alerts",
        state.config.persist_timeout(),
        state.alerts.list_alerts(params.limit()),
    )
    .await?;
    Ok(Json(alerts))
}

async fn list_logs(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ListQuery>,
) -> Result<Json<Vec<AutomationLogEntry>>, ApiError> {
    // ---
    let filter = LogFilter {
        decision: params.decision,
        limit: params.limit(),
    };
    let logs = bounded(
        "list automation logs",
        state.config.persist_timeout(),
        state.alerts.list_logs(filter),
    )
    .await?;
    Ok(Json(logs))
}
