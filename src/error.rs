//! Error types for the Ratekeeper service.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::ScriptKind;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors. Fatal at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Per-call store failures, surfaced only by the non-absorbing APIs.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Caller contract violations
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure of a single round trip to the shared store.
///
/// Every variant is routed through the fail-open / fail-close policy by
/// [`RateLimitStore::try_decide`](crate::ratelimit::RateLimitStore::try_decide).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection broke.
    #[error("transport failure: {0}")]
    Transport(#[from] redis::RedisError),

    /// The call did not complete before the deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store does not know the script (flushed or restarted).
    #[error("script {0} is not loaded on the store")]
    ScriptNotLoaded(ScriptKind),

    /// The script replied with something other than the expected integer array.
    #[error("unexpected reply from {script}: {detail}")]
    UnexpectedReply { script: ScriptKind, detail: String },
}

impl StoreError {
    /// Whether repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            StoreError::Timeout(_) | StoreError::ScriptNotLoaded(_) => true,
            StoreError::UnexpectedReply { .. } => false,
        }
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
