//! Periodic tail-to-index loop.
//!
//! A [`Pump`] owns the cursor. Each cycle pings the engine, reads the lines
//! appended since the cursor, indexes them in log order, and persists the new
//! cursor. Only one cycle runs at a time: a tick or manual trigger that
//! arrives while a cycle is running is refused, not queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tripwire_core::IndexEngine;

use crate::error::Result;
use crate::pipeline::indexer::{Indexer, RecordOutcome};
use crate::tail::{Cursor, CursorStore, LogTailer};

/// Configuration for the pump loop.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Time between cycles.
    /// Default: 5 seconds
    pub poll_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Counts for one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub indexed: u64,
    pub failed: u64,
    pub malformed: u64,
    /// The log was truncated or replaced and reading restarted at 0.
    pub reset: bool,
    /// Shutdown was requested before the batch was finished.
    pub interrupted: bool,
    /// Cursor committed at the end of the cycle.
    pub cursor: Cursor,
}

impl CycleReport {
    pub fn records(&self) -> u64 {
        self.indexed + self.failed + self.malformed
    }
}

/// Result of asking the pump to run a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran.
    Completed(CycleReport),
    /// The engine did not answer a ping; the cursor did not move.
    EngineUnavailable,
    /// Another cycle was already running.
    Busy,
}

/// Single-flight pump from the event log into the index.
pub struct Pump<E> {
    tailer: LogTailer,
    indexer: Indexer<E>,
    store: CursorStore,
    config: PumpConfig,
    /// Held for the duration of a cycle.
    cursor: Mutex<Cursor>,
    schema_ready: AtomicBool,
    running: Arc<AtomicBool>,
}

impl<E: IndexEngine> Pump<E> {
    /// Create a pump, resuming from the cursor saved in `store`.
    ///
    /// `running` is the shutdown flag: once it is cleared the pump stops
    /// between records and returns from [`Pump::run`].
    pub fn new(
        tailer: LogTailer,
        indexer: Indexer<E>,
        store: CursorStore,
        config: PumpConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let cursor = store.load()?;
        info!(
            log = %tailer.config().path.display(),
            cursor = %store.path().display(),
            offset = cursor.offset,
            "pump resuming"
        );
        tripwire_core::metrics::set_gauge("indexer_cursor_offset", cursor.offset as f64);

        Ok(Self {
            tailer,
            indexer,
            store,
            config,
            cursor: Mutex::new(cursor),
            schema_ready: AtomicBool::new(false),
            running,
        })
    }

    pub fn indexer(&self) -> &Indexer<E> {
        &self.indexer
    }

    /// The committed cursor, or `None` while a cycle holds it.
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor.try_lock().ok().map(|c| *c)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run cycles on the configured cadence until shutdown.
    pub async fn run(&self) -> Result<()> {
        tripwire_core::metrics::set_gauge("ingest_running", 1.0);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.is_running() {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            match self.run_cycle().await {
                Ok(CycleOutcome::Completed(report)) if report.records() > 0 => {
                    info!(
                        indexed = report.indexed,
                        failed = report.failed,
                        malformed = report.malformed,
                        offset = report.cursor.offset,
                        "cycle complete"
                    );
                }
                Ok(CycleOutcome::Completed(_)) => {}
                Ok(CycleOutcome::EngineUnavailable) => {
                    warn!("index engine unreachable, cycle skipped");
                }
                Ok(CycleOutcome::Busy) => debug!("previous cycle still running"),
                Err(e) => error!(error = %e, "cycle failed"),
            }
        }

        tripwire_core::metrics::set_gauge("ingest_running", 0.0);
        info!("pump stopped");
        Ok(())
    }

    /// Run one cycle now unless one is already in progress.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(mut cursor) = self.cursor.try_lock() else {
            tripwire_core::metrics::increment("indexer_cycles_skipped_total", 1);
            return Ok(CycleOutcome::Busy);
        };

        if !self.indexer.is_available().await {
            tripwire_core::metrics::increment("indexer_cycles_skipped_total", 1);
            return Ok(CycleOutcome::EngineUnavailable);
        }

        if !self.schema_ready.load(Ordering::SeqCst) {
            self.indexer.ensure_schema().await?;
            self.schema_ready.store(true, Ordering::SeqCst);
        }

        let tailer = self.tailer.clone();
        let from = *cursor;
        let batch = tokio::task::spawn_blocking(move || tailer.poll(&from)).await??;

        let mut report = CycleReport {
            reset: batch.reset,
            ..CycleReport::default()
        };
        let mut committed = batch.from;
        let next_cursor = batch.next_cursor;

        for line in batch {
            if !self.is_running() {
                report.interrupted = true;
                break;
            }
            match self.indexer.index_line(&line).await {
                RecordOutcome::Indexed(_) => report.indexed += 1,
                RecordOutcome::Failed => report.failed += 1,
                RecordOutcome::Malformed => report.malformed += 1,
            }
            committed.offset = line.end;
        }
        if !report.interrupted {
            committed = next_cursor;
        }

        if committed != *cursor {
            *cursor = committed;
            self.store.save(&committed)?;
            tripwire_core::metrics::set_gauge("indexer_cursor_offset", committed.offset as f64);
        }
        report.cursor = committed;

        Ok(CycleOutcome::Completed(report))
    }
}
