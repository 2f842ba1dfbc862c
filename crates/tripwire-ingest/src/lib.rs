//! Tripwire ingest: turns the attack event log into searchable documents.
//!
//! # Modules
//!
//! - [`tail`] - Cursor-based reader for the append-only log
//! - [`pipeline`] - Indexer and the periodic pump
//!
//! The event log is the source of truth; the index is derived from it and can
//! be rebuilt by deleting the cursor file.

pub mod error;
pub mod pipeline;
pub mod tail;

pub use error::{Error, Result};
pub use pipeline::{
    CycleOutcome, CycleReport, Indexer, IndexerConfig, IndexerStats, Pump, PumpConfig,
    RecordOutcome, document_id,
};
pub use tail::{Cursor, CursorStore, LogLine, LogTailer, TailBatch, TailerConfig};
