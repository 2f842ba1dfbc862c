//! API route definitions.

mod attacks;
mod health;
mod stats;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware;
use axum::response::Response;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete API router.
///
/// - `GET /health` - Liveness
/// - `GET /health/ready` - Engine reachability
/// - `GET /api/attacks?limit=` - Recent events, newest first
/// - `GET /api/stats?hours=` - Totals, top categories/countries, hourly timeline
pub fn router(state: AppState) -> Router {
    let health = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::ready));

    let api = Router::new()
        .route("/attacks", get(attacks::recent))
        .route("/stats", get(stats::overview))
        .layer(middleware::map_response(add_cache_headers));

    Router::new()
        .merge(health)
        .nest("/api", api)
        .with_state(state)
}

/// Let clients reuse a response for as long as the server-side cache would.
async fn add_cache_headers(mut response: Response) -> Response {
    if response.status().is_success() {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=10"),
        );
    }
    response
}
