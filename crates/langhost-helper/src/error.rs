//! Helper protocol errors.

use std::time::Duration;

use thiserror::Error;

/// Failure of a helper exchange as seen by the client, or of one framing
/// step inside the server.
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UTF-16 body: {0}")]
    Encoding(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Exchange timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the channel before a complete frame arrived.
    #[error("Channel closed")]
    Closed,
}
