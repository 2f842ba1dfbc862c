//! Core types and shared utilities for the Tripwire attack-event pipeline.
//!
//! This crate provides:
//! - The [`AttackEvent`] model and its one-line JSON log format
//! - The [`IndexEngine`] contract plus an Elasticsearch implementation
//! - An in-memory engine for tests ([`testing::MemoryEngine`])
//! - Prometheus metrics helpers
//! - Shared error types

pub mod engine;
mod error;
mod event;
pub mod metrics;
pub mod testing;

pub use engine::{
    Aggregation, Bucket, BucketKey, DEFAULT_ATTACK_INDEX, ElasticConfig, ElasticEngine, Field,
    FieldType, Hit, IndexEngine, IndexSchema, SearchQuery, SearchResult, SortSpec,
};
pub use error::{Error, Result};
pub use event::{AttackCategory, AttackEvent, GeoInfo, GeoPoint};
