//! Tripwire Serve - read-only HTTP API over indexed attack events
//!
//! Dashboards poll two endpoints: the most recent events and an aggregate
//! view (totals, top categories and countries, hourly timeline). Both stay
//! up when the search engine is not: they answer with empty or zeroed data
//! and log the failure.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (query facade, configuration)
//! - **QueryFacade**: Engine queries with caching, timeouts and degradation
//! - **Routes**: Endpoint handlers grouped by domain

pub mod cache;
mod error;
pub mod query;
mod routes;
mod state;

pub use self::cache::{ResponseCache, get_or_compute, new_cache};
pub use self::error::ApiError;
pub use self::query::{AttackRecord, QueryFacade, StatsResponse};
pub use self::routes::router;
pub use self::state::{AppState, Config};
