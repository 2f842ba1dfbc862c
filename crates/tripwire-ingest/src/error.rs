//! Error types for the ingest pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tailing and indexing the event log.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the event log or the cursor file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index engine or event model error.
    #[error(transparent)]
    Core(#[from] tripwire_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
