//! Dashboard aggregates.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::error::ApiError;
use crate::query::StatsResponse;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    /// Timeline window in hours (default: 24, max: 168).
    pub hours: Option<u32>,
}

/// `GET /api/stats`
///
/// Returns `{total, byType, byCountry, timeline}`; zeroed when the engine is
/// unavailable.
pub async fn overview(
    State(state): State<AppState>,
    params: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<StatsResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(state.queries.stats(params.hours).await))
}
