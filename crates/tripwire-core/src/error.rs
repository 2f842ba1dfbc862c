//! Error types shared by the Tripwire crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the event model and the index engine contract.
#[derive(Error, Debug)]
pub enum Error {
    /// A field has a value outside its allowed set.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure talking to the index engine.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The index engine answered with a non-success status.
    #[error("index engine returned {status}: {body}")]
    Engine {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The index engine could not be reached at all.
    #[error("index engine unavailable: {0}")]
    Unavailable(String),

    /// The engine returned a response we could not interpret.
    #[error("unexpected engine response: {0}")]
    UnexpectedResponse(String),
}
