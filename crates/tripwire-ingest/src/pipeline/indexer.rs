//! Submits log lines to the search index.
//!
//! Each line is parsed as an [`AttackEvent`] and upserted under an id derived
//! from its position and content, so replaying a region of the log never
//! creates duplicates. A line that cannot be parsed or is refused by the
//! engine is logged, counted, and skipped; it never blocks the lines after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use tripwire_core::{AttackEvent, DEFAULT_ATTACK_INDEX, IndexEngine, IndexSchema};

use crate::error::Result;
use crate::tail::LogLine;

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Target index name.
    /// Default: "attacks"
    pub index: String,

    /// Timeout for a single upsert.
    /// Default: 10 seconds
    pub submit_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            index: DEFAULT_ATTACK_INDEX.to_string(),
            submit_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored under this id.
    Indexed(String),
    /// Engine error or timeout.
    Failed,
    /// Not a valid attack event.
    Malformed,
}

/// Running totals since the indexer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub indexed: u64,
    pub failed: u64,
    pub malformed: u64,
}

/// Stable document id for a log line: the first 32 hex characters of
/// SHA-256 over the line's start offset (big-endian) and its bytes.
pub fn document_id(start: u64, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(start.to_be_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Writes attack events from the log into an [`IndexEngine`].
pub struct Indexer<E> {
    engine: E,
    config: IndexerConfig,
    indexed: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

impl<E: IndexEngine> Indexer<E> {
    pub fn new(engine: E, config: IndexerConfig) -> Self {
        Self {
            engine,
            config,
            indexed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn index_name(&self) -> &str {
        &self.config.index
    }

    /// Create the target index with the attack-event mappings if missing.
    ///
    /// Returns `true` if the index was created by this call.
    pub async fn ensure_schema(&self) -> Result<bool> {
        let created = self
            .engine
            .ensure_index(&self.config.index, &IndexSchema::attack_events())
            .await?;
        if created {
            info!(index = %self.config.index, "created index");
        } else {
            debug!(index = %self.config.index, "index already exists");
        }
        Ok(created)
    }

    /// Whether the engine answers a ping.
    pub async fn is_available(&self) -> bool {
        match self.engine.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "index engine ping failed");
                false
            }
        }
    }

    /// Parse and upsert one log line.
    pub async fn index_line(&self, line: &LogLine) -> RecordOutcome {
        let event = match AttackEvent::from_line(&line.bytes) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = line.start, error = %e, "skipping malformed log line");
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tripwire_core::metrics::increment("indexer_records_malformed_total", 1);
                return RecordOutcome::Malformed;
            }
        };

        let document = match serde_json::to_value(&event) {
            Ok(document) => document,
            Err(e) => {
                warn!(offset = line.start, error = %e, "skipping unserializable event");
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tripwire_core::metrics::increment("indexer_records_malformed_total", 1);
                return RecordOutcome::Malformed;
            }
        };

        let id = document_id(line.start, &line.bytes);
        let submit = self
            .engine
            .upsert(&self.config.index, Some(&id), &document);

        let error = match tokio::time::timeout(self.config.submit_timeout, submit).await {
            Ok(Ok(stored)) => {
                self.indexed.fetch_add(1, Ordering::Relaxed);
                tripwire_core::metrics::increment("indexer_records_indexed_total", 1);
                debug!(offset = line.start, id = %stored, category = %event.category, "indexed");
                return RecordOutcome::Indexed(stored);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timed out after {}ms",
                self.config.submit_timeout.as_millis()
            ),
        };

        warn!(offset = line.start, id = %id, error = %error, "failed to index record, skipping");
        self.failed.fetch_add(1, Ordering::Relaxed);
        tripwire_core::metrics::increment("indexer_records_failed_total", 1);
        RecordOutcome::Failed
    }

    pub fn stats(&self) -> IndexerStats {
        IndexerStats {
            indexed: self.indexed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::testing::MemoryEngine;

    const EVENT: &str = r#"{"timestamp":"2024-05-01T12:00:00.000Z","type":"SQL_INJECTION","ip":"203.0.113.1","method":"POST","url":"/login","userAgent":"curl","details":"Username: ' --","geo":{"country":"NZ","city":"Wellington","ll":{"lat":-41.3,"lon":174.8}}}"#;

    fn line(start: u64, text: &str) -> LogLine {
        LogLine {
            start,
            end: start + text.len() as u64 + 1,
            bytes: text.as_bytes().to_vec(),
        }
    }

    fn indexer() -> Indexer<MemoryEngine> {
        Indexer::new(MemoryEngine::new(), IndexerConfig::default())
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = document_id(0, EVENT.as_bytes());
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, document_id(0, EVENT.as_bytes()));
        // Same content at another offset is another record.
        assert_ne!(a, document_id(1, EVENT.as_bytes()));
    }

    #[tokio::test]
    async fn test_ensure_schema_once() {
        let ix = indexer();
        assert!(ix.ensure_schema().await.unwrap());
        assert!(!ix.ensure_schema().await.unwrap());
        let schema = ix.engine().schema("attacks").unwrap();
        assert!(schema.field("geo.ll").is_some());
    }

    #[tokio::test]
    async fn test_index_line_uses_stable_id() {
        let ix = indexer();
        let l = line(0, EVENT);
        let expected = document_id(0, EVENT.as_bytes());
        assert_eq!(ix.index_line(&l).await, RecordOutcome::Indexed(expected.clone()));
        // Replaying the same line overwrites rather than duplicates.
        ix.index_line(&l).await;
        assert_eq!(ix.engine().document_ids("attacks"), vec![expected]);

        let doc = &ix.engine().documents("attacks")[0];
        assert_eq!(doc["type"], "SQL_INJECTION");
        assert_eq!(doc["geo"]["ll"]["lon"], 174.8);
        assert_eq!(ix.stats().indexed, 2);
    }

    #[tokio::test]
    async fn test_malformed_line_skipped() {
        let ix = indexer();
        assert_eq!(ix.index_line(&line(0, "{\"timestamp\":")).await, RecordOutcome::Malformed);
        assert_eq!(
            ix.index_line(&line(0, r#"{"type":"NOPE"}"#)).await,
            RecordOutcome::Malformed
        );
        assert_eq!(ix.engine().upsert_calls(), 0);
        assert_eq!(ix.stats().malformed, 2);
    }

    #[tokio::test]
    async fn test_rejected_record_counted() {
        let ix = indexer();
        ix.engine().reject_when(|_| true);
        assert_eq!(ix.index_line(&line(0, EVENT)).await, RecordOutcome::Failed);
        assert_eq!(ix.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_submit_timeout() {
        let ix = Indexer::new(
            MemoryEngine::new(),
            IndexerConfig {
                submit_timeout: Duration::from_millis(50),
                ..IndexerConfig::default()
            },
        );
        ix.engine().set_delay(Some(Duration::from_secs(2)));
        assert_eq!(ix.index_line(&line(0, EVENT)).await, RecordOutcome::Failed);
        assert!(ix.engine().documents("attacks").is_empty());
    }

    #[tokio::test]
    async fn test_availability() {
        let ix = indexer();
        assert!(ix.is_available().await);
        ix.engine().set_unreachable(true);
        assert!(!ix.is_available().await);
    }
}
