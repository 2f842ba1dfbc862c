//! Read-only queries over the attack index.
//!
//! Every method answers with data even when the engine is down: failures are
//! logged and turned into an empty list or zeroed stats.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tripwire_core::{Aggregation, Bucket, IndexEngine, SearchQuery};

use crate::cache::{ResponseCache, get_or_compute};
use crate::error::ApiError;

pub const DEFAULT_RECENT_LIMIT: usize = 100;
pub const MAX_RECENT_LIMIT: usize = 500;

pub const DEFAULT_STATS_HOURS: u32 = 24;
pub const MAX_STATS_HOURS: u32 = 24 * 7;

const TOP_TYPES: usize = 20;
const TOP_COUNTRIES: usize = 10;

/// One indexed attack event with its document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRecord {
    pub id: String,
    #[serde(flatten)]
    pub source: Map<String, Value>,
}

/// Aggregate view for dashboards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// All indexed events.
    pub total: u64,
    /// Top categories by count.
    pub by_type: Vec<Bucket>,
    /// Top source countries by count.
    pub by_country: Vec<Bucket>,
    /// Hourly counts over the requested window.
    pub timeline: Vec<Bucket>,
}

/// Query facade over an [`IndexEngine`].
#[derive(Clone)]
pub struct QueryFacade {
    engine: Arc<dyn IndexEngine>,
    index: String,
    cache: ResponseCache,
    timeout: Duration,
}

impl QueryFacade {
    pub fn new(
        engine: Arc<dyn IndexEngine>,
        index: impl Into<String>,
        cache: ResponseCache,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            index: index.into(),
            cache,
            timeout,
        }
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: Option<usize>) -> Vec<AttackRecord> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
        let key = format!("recent:{}", limit);

        get_or_compute(&self.cache, &key, || self.fetch_recent(limit))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    limit,
                    "recent attacks query failed, returning empty list"
                );
                Vec::new()
            })
    }

    /// Totals, top categories and countries, and an hourly timeline over the
    /// last `hours` hours.
    pub async fn stats(&self, hours: Option<u32>) -> StatsResponse {
        let hours = hours.unwrap_or(DEFAULT_STATS_HOURS).clamp(1, MAX_STATS_HOURS);
        let key = format!("stats:{}", hours);

        get_or_compute(&self.cache, &key, || self.fetch_stats(hours))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, hours, "stats query failed, returning zeroed stats");
                StatsResponse::default()
            })
    }

    /// Whether the engine answers a ping within the query timeout.
    pub async fn ready(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, self.engine.ping()).await,
            Ok(Ok(()))
        )
    }

    async fn search(&self, query: &SearchQuery) -> Result<tripwire_core::SearchResult, ApiError> {
        tokio::time::timeout(self.timeout, self.engine.search(&self.index, query))
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(ApiError::from)
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<AttackRecord>, ApiError> {
        let result = self
            .search(&SearchQuery::latest("timestamp", limit))
            .await?;

        Ok(result
            .hits
            .into_iter()
            .map(|hit| AttackRecord {
                id: hit.id,
                source: match hit.source {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
            })
            .collect())
    }

    async fn fetch_stats(&self, hours: u32) -> Result<StatsResponse, ApiError> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
        let query = SearchQuery::aggregate(vec![
            Aggregation::Terms {
                name: "by_type".to_string(),
                field: "type".to_string(),
                size: TOP_TYPES,
            },
            Aggregation::Terms {
                name: "by_country".to_string(),
                field: "geo.country".to_string(),
                size: TOP_COUNTRIES,
            },
            Aggregation::DateHistogram {
                name: "timeline".to_string(),
                field: "timestamp".to_string(),
                interval: Duration::from_secs(3600),
                since: Some(since),
            },
        ]);

        let result = self.search(&query).await?;
        Ok(StatsResponse {
            total: result.total,
            by_type: result.buckets("by_type"),
            by_country: result.buckets("by_country"),
            timeline: result.buckets("timeline"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::new_cache;
    use tripwire_core::BucketKey;
    use tripwire_core::testing::MemoryEngine;

    fn doc(minutes_ago: i64, kind: &str, country: &str) -> Value {
        let ts = Utc::now() - chrono::Duration::minutes(minutes_ago);
        serde_json::json!({
            "timestamp": ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "type": kind,
            "ip": "203.0.113.1",
            "method": "GET",
            "url": "/",
            "userAgent": "test",
            "details": "",
            "geo": {"country": country, "city": "Unknown", "ll": {"lat": 0.0, "lon": 0.0}},
        })
    }

    async fn seeded() -> (Arc<MemoryEngine>, QueryFacade) {
        let engine = Arc::new(MemoryEngine::new());
        let docs = [
            doc(5, "SQL_INJECTION", "NZ"),
            doc(10, "SQL_INJECTION", "DE"),
            doc(70, "XSS_ATTEMPT", "NZ"),
            doc(60 * 24 * 3, "404_SCAN", "US"),
        ];
        for (i, d) in docs.iter().enumerate() {
            engine
                .upsert("attacks", Some(&format!("doc-{}", i)), d)
                .await
                .unwrap();
        }
        let facade = QueryFacade::new(
            engine.clone(),
            "attacks",
            new_cache(),
            Duration::from_secs(2),
        );
        (engine, facade)
    }

    #[tokio::test]
    async fn test_recent_newest_first_with_ids() {
        let (_, facade) = seeded().await;
        let recent = facade.recent(Some(2)).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "doc-0");
        assert_eq!(recent[1].id, "doc-1");
        assert_eq!(recent[0].source["type"], "SQL_INJECTION");

        let json = serde_json::to_value(&recent[0]).unwrap();
        assert_eq!(json["id"], "doc-0");
        assert_eq!(json["geo"]["country"], "NZ");
    }

    #[tokio::test]
    async fn test_recent_limit_bounds() {
        let (_, facade) = seeded().await;
        assert_eq!(facade.recent(None).await.len(), 4);
        assert_eq!(facade.recent(Some(0)).await.len(), 1);
        assert_eq!(facade.recent(Some(10_000)).await.len(), 4);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (_, facade) = seeded().await;
        let stats = facade.stats(None).await;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_type[0].key, BucketKey::Term("SQL_INJECTION".to_string()));
        assert_eq!(stats.by_type[0].doc_count, 2);
        assert_eq!(stats.by_country[0].key, BucketKey::Term("NZ".to_string()));

        // The three-day-old event is outside the 24h timeline.
        let in_timeline: u64 = stats.timeline.iter().map(|b| b.doc_count).sum();
        assert_eq!(in_timeline, 3);
        assert!(stats.timeline.iter().all(|b| b.key_as_string.is_some()));

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("byType").is_some());
        assert!(json.get("byCountry").is_some());
    }

    #[tokio::test]
    async fn test_unreachable_engine_degrades() {
        let (engine, facade) = seeded().await;
        engine.set_unreachable(true);
        assert_eq!(facade.stats(Some(48)).await, StatsResponse::default());
        assert!(facade.recent(Some(7)).await.is_empty());
        assert!(!facade.ready().await);
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let (engine, facade) = seeded().await;
        let first = facade.stats(None).await;
        engine.set_unreachable(true);
        assert_eq!(facade.stats(None).await, first);
    }

    #[test]
    fn test_zero_stats_json() {
        let json = serde_json::to_value(StatsResponse::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"total": 0, "byType": [], "byCountry": [], "timeline": []})
        );
    }
}
