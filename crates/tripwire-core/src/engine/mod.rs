//! Index engine contract.
//!
//! The search engine is an opaque collaborator: Tripwire only needs to make
//! sure an index exists with the right field types, upsert documents into it,
//! and run a small, typed family of searches (latest-N and bucket
//! aggregations). [`IndexEngine`] captures exactly that, so the ingest pump
//! and the query API can run against Elasticsearch in production and against
//! [`crate::testing::MemoryEngine`] in tests.
//!
//! # Available Engines
//!
//! - [`ElasticEngine`] - Elasticsearch over its REST API

mod elastic;

pub use elastic::{ElasticConfig, ElasticEngine};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Name of the index attack events are written to, unless configured.
pub const DEFAULT_ATTACK_INDEX: &str = "attacks";

/// An external document store with upsert and aggregate-query capability.
#[async_trait]
pub trait IndexEngine: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Create `index` with `schema` unless it already exists.
    ///
    /// Returns `true` if the index was created by this call. Safe to call on
    /// every boot.
    async fn ensure_index(&self, index: &str, schema: &IndexSchema) -> Result<bool>;

    /// Insert or replace a document.
    ///
    /// With `id = None` the engine assigns one. Returns the document id.
    async fn upsert(&self, index: &str, id: Option<&str>, document: &Value) -> Result<String>;

    /// Run a search and return hits plus any requested aggregations.
    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResult>;
}

#[async_trait]
impl<E> IndexEngine for Arc<E>
where
    E: IndexEngine + ?Sized,
{
    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn ensure_index(&self, index: &str, schema: &IndexSchema) -> Result<bool> {
        (**self).ensure_index(index, schema).await
    }

    async fn upsert(&self, index: &str, id: Option<&str>, document: &Value) -> Result<String> {
        (**self).upsert(index, id, document).await
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResult> {
        (**self).search(index, query).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════

/// Field types the index must support.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Date,
    Keyword,
    Ip,
    Text,
    GeoPoint,
    /// Plain object with typed sub-fields.
    Object(Vec<Field>),
    /// Array of independently-queried objects.
    Nested(Vec<Field>),
}

/// A named, typed field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Declared field types of an index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSchema {
    pub fields: Vec<Field>,
}

impl IndexSchema {
    /// Schema of the attack event index.
    pub fn attack_events() -> Self {
        Self {
            fields: vec![
                Field::new("timestamp", FieldType::Date),
                Field::new("type", FieldType::Keyword),
                Field::new("ip", FieldType::Ip),
                Field::new("method", FieldType::Keyword),
                Field::new("url", FieldType::Text),
                Field::new("userAgent", FieldType::Text),
                Field::new("details", FieldType::Text),
                Field::new(
                    "geo",
                    FieldType::Object(vec![
                        Field::new("country", FieldType::Keyword),
                        Field::new("city", FieldType::Keyword),
                        Field::new("ll", FieldType::GeoPoint),
                    ]),
                ),
            ],
        }
    }

    /// Look up a field by dotted path (e.g. `geo.country`).
    pub fn field(&self, path: &str) -> Option<&Field> {
        let mut fields = &self.fields;
        let mut found = None;
        for part in path.split('.') {
            let field = fields.iter().find(|f| f.name == part)?;
            found = Some(field);
            fields = match &field.kind {
                FieldType::Object(sub) | FieldType::Nested(sub) => sub,
                _ => &EMPTY_FIELDS,
            };
        }
        found
    }
}

static EMPTY_FIELDS: Vec<Field> = Vec::new();

// ═══════════════════════════════════════════════════════════════════════════
// Search
// ═══════════════════════════════════════════════════════════════════════════

/// Sort order for hits.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

/// A bucket aggregation to compute alongside the hits.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Top-`size` values of a keyword field by document count.
    Terms {
        name: String,
        field: String,
        size: usize,
    },
    /// Fixed-width time buckets, optionally restricted to `since..`.
    DateHistogram {
        name: String,
        field: String,
        interval: Duration,
        since: Option<DateTime<Utc>>,
    },
}

impl Aggregation {
    pub fn name(&self) -> &str {
        match self {
            Self::Terms { name, .. } | Self::DateHistogram { name, .. } => name,
        }
    }
}

/// Typed search request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchQuery {
    /// Maximum number of hits to return (0 for aggregations only).
    pub size: usize,
    pub sort: Option<SortSpec>,
    pub aggregations: Vec<Aggregation>,
}

impl SearchQuery {
    /// Latest `size` documents by `field`, newest first.
    pub fn latest(field: &str, size: usize) -> Self {
        Self {
            size,
            sort: Some(SortSpec {
                field: field.to_string(),
                descending: true,
            }),
            aggregations: Vec::new(),
        }
    }

    /// Aggregations only, no hits.
    pub fn aggregate(aggregations: Vec<Aggregation>) -> Self {
        Self {
            size: 0,
            sort: None,
            aggregations,
        }
    }
}

/// A returned document.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// Bucket key: a term, or the bucket start in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketKey {
    Millis(i64),
    Term(String),
}

/// One aggregation bucket, in the engine's `{key, doc_count}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_as_string: Option<String>,
    pub key: BucketKey,
    pub doc_count: u64,
}

/// Search response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResult {
    /// Total number of matching documents.
    pub total: u64,
    pub hits: Vec<Hit>,
    /// Buckets keyed by aggregation name.
    pub aggregations: HashMap<String, Vec<Bucket>>,
}

impl SearchResult {
    /// Buckets of an aggregation, empty if absent.
    pub fn buckets(&self, name: &str) -> Vec<Bucket> {
        self.aggregations.get(name).cloned().unwrap_or_default()
    }
}
