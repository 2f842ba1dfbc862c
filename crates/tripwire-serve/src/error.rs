//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
///
/// The attack and stats endpoints degrade to empty results instead of
/// surfacing engine errors; these variants cover everything else.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The index engine failed or is unreachable.
    #[error("engine error: {0}")]
    Engine(#[from] tripwire_core::Error),

    /// The engine did not answer within the query timeout.
    #[error("engine timed out")]
    Timeout,
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            Self::Engine(err) => {
                tracing::error!(error = %err, "engine error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "engine_unavailable",
                    Some("The search engine is unavailable".to_string()),
                )
            }
            Self::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "engine_timeout",
                Some("The search engine did not respond in time".to_string()),
            ),
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
