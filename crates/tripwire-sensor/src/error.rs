//! Error types for the sensor.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while recording attack events.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the event log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the shared core crate (event serialization).
    #[error(transparent)]
    Core(#[from] tripwire_core::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Geo table could not be loaded.
    #[error("Geo table error: {0}")]
    Geo(String),
}
