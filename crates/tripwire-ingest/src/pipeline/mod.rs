//! Pipeline from the tailed log into the search index.
//!
//! - [`Indexer`] - Parses log lines and upserts them with stable ids
//! - [`Pump`] - Periodic single-flight loop that owns and persists the cursor
//!
//! ```text
//! [LogTailer] → [Indexer] → [IndexEngine]
//!      ↑             ↓
//!   Cursor ←── CursorStore
//! ```

mod indexer;
mod pump;

pub use indexer::{Indexer, IndexerConfig, IndexerStats, RecordOutcome, document_id};
pub use pump::{CycleOutcome, CycleReport, Pump, PumpConfig};
