//! Recent attack events.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::error::ApiError;
use crate::query::AttackRecord;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct AttacksQuery {
    /// Number of events (default: 100, max: 500).
    pub limit: Option<usize>,
}

/// `GET /api/attacks`
///
/// Most recent events, newest first. Empty when the engine is unavailable.
pub async fn recent(
    State(state): State<AppState>,
    params: Result<Query<AttacksQuery>, QueryRejection>,
) -> Result<Json<Vec<AttackRecord>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(state.queries.recent(params.limit).await))
}
