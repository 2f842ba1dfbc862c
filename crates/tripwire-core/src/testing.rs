//! Testing utilities including an in-memory index engine.
//!
//! [`MemoryEngine`] implements [`IndexEngine`] without a network, evaluates the
//! typed [`SearchQuery`] directly, and can be told to fail in the ways a real
//! cluster does (unreachable, rejecting specific documents, slow).

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::{
    Aggregation, Bucket, BucketKey, Hit, IndexEngine, IndexSchema, SearchQuery, SearchResult,
};
use crate::{Error, Result};

type RejectFn = Box<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryIndex {
    schema: IndexSchema,
    /// Documents in insertion order; an upsert with a known id replaces in place.
    docs: Vec<(String, Value)>,
}

/// In-memory [`IndexEngine`] for tests.
#[derive(Default)]
pub struct MemoryEngine {
    indices: Mutex<HashMap<String, MemoryIndex>>,
    unreachable: AtomicBool,
    reject: Mutex<Option<RejectFn>>,
    delay: Mutex<Option<Duration>>,
    upsert_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`Error::Unavailable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Reject upserts of documents matching `predicate` with a 400.
    pub fn reject_when<F>(&self, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        *self.reject.lock() = Some(Box::new(predicate));
    }

    /// Sleep before answering each upsert.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of upsert attempts, including rejected ones.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indices.lock().contains_key(index)
    }

    pub fn schema(&self, index: &str) -> Option<IndexSchema> {
        self.indices.lock().get(index).map(|i| i.schema.clone())
    }

    /// Stored documents in insertion order.
    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.indices
            .lock()
            .get(index)
            .map(|i| i.docs.iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default()
    }

    /// Stored document ids in insertion order.
    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.indices
            .lock()
            .get(index)
            .map(|i| i.docs.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory engine marked unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexEngine for MemoryEngine {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn ensure_index(&self, index: &str, schema: &IndexSchema) -> Result<bool> {
        self.check_reachable()?;
        let mut indices = self.indices.lock();
        if indices.contains_key(index) {
            return Ok(false);
        }
        indices.insert(
            index.to_string(),
            MemoryIndex {
                schema: schema.clone(),
                docs: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn upsert(&self, index: &str, id: Option<&str>, document: &Value) -> Result<String> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_reachable()?;

        let rejected = self.reject.lock().as_ref().is_some_and(|f| f(document));
        if rejected {
            return Err(Error::Engine {
                status: 400,
                body: "mapper_parsing_exception".to_string(),
            });
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        };

        let mut indices = self.indices.lock();
        let docs = &mut indices.entry(index.to_string()).or_default().docs;
        match docs.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = document.clone(),
            None => docs.push((id.clone(), document.clone())),
        }

        Ok(id)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResult> {
        self.check_reachable()?;

        let docs: Vec<(String, Value)> = self
            .indices
            .lock()
            .get(index)
            .map(|i| i.docs.clone())
            .ok_or_else(|| Error::Engine {
                status: 404,
                body: format!("index_not_found_exception: {}", index),
            })?;

        let mut hits: Vec<Hit> = docs
            .iter()
            .map(|(id, source)| Hit {
                id: id.clone(),
                source: source.clone(),
            })
            .collect();

        if let Some(sort) = &query.sort {
            hits.sort_by(|a, b| {
                let ord = compare_fields(
                    lookup(&a.source, &sort.field),
                    lookup(&b.source, &sort.field),
                );
                if sort.descending { ord.reverse() } else { ord }
            });
        }
        hits.truncate(query.size);

        let aggregations = query
            .aggregations
            .iter()
            .map(|agg| (agg.name().to_string(), aggregate(agg, &docs)))
            .collect();

        Ok(SearchResult {
            total: docs.len() as u64,
            hits,
            aggregations,
        })
    }
}

/// Resolve a dotted field path inside a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, part| node.get(part))
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => match (as_datetime(a), as_datetime(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        },
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        (None, None) => CmpOrdering::Equal,
    }
}

fn aggregate(agg: &Aggregation, docs: &[(String, Value)]) -> Vec<Bucket> {
    match agg {
        Aggregation::Terms { field, size, .. } => {
            let mut counts: HashMap<String, u64> = HashMap::new();
            for (_, doc) in docs {
                if let Some(term) = lookup(doc, field).and_then(Value::as_str) {
                    *counts.entry(term.to_string()).or_default() += 1;
                }
            }
            let mut buckets: Vec<(String, u64)> = counts.into_iter().collect();
            buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            buckets
                .into_iter()
                .take(*size)
                .map(|(key, doc_count)| Bucket {
                    key_as_string: None,
                    key: BucketKey::Term(key),
                    doc_count,
                })
                .collect()
        }
        Aggregation::DateHistogram {
            field,
            interval,
            since,
            ..
        } => {
            let width = (interval.as_millis() as i64).max(1);
            let mut counts: std::collections::BTreeMap<i64, u64> = Default::default();
            for (_, doc) in docs {
                let Some(ts) = lookup(doc, field).and_then(as_datetime) else {
                    continue;
                };
                if since.is_some_and(|since| ts < since) {
                    continue;
                }
                let millis = ts.timestamp_millis();
                *counts.entry(millis - millis.rem_euclid(width)).or_default() += 1;
            }
            counts
                .into_iter()
                .map(|(start, doc_count)| Bucket {
                    key_as_string: DateTime::<Utc>::from_timestamp_millis(start)
                        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    key: BucketKey::Millis(start),
                    doc_count,
                })
                .collect()
        }
    }
}
