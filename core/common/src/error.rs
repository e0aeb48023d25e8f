//! Common error types for hybridsync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for hybridsync operations.
///
/// Only [`Error::LocalWrite`] and explicit admin actions are expected to reach
/// callers of the write path; cloud and enqueue failures are absorbed into
/// queue state by the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The authoritative local write failed.
    #[error("Local write failed: {0}")]
    LocalWrite(String),

    /// Reading from the local store failed.
    #[error("Local read failed: {0}")]
    LocalRead(String),

    /// A mutation could not be placed in the outbox.
    #[error("Enqueue failed: {0}")]
    Enqueue(#[from] EnqueueError),

    /// The cloud replica rejected or could not serve a request.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// A per-shop policy could not be loaded or stored.
    #[error("Policy load error: {0}")]
    PolicyLoad(String),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sync is disabled for the requested scope.
    #[error("Sync disabled: {0}")]
    SyncDisabled(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Categorized failure reported by a cloud adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// Credentials were rejected. Retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote asked us to slow down.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Transport failure or a server-side error.
    #[error("network error: {0}")]
    Network(String),

    /// The remote rejected the payload itself.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CloudError {
    /// Short machine-readable category name.
    pub fn kind(&self) -> &'static str {
        match self {
            CloudError::Auth(_) => "auth",
            CloudError::RateLimit { .. } => "rateLimit",
            CloudError::Network(_) => "network",
            CloudError::Validation(_) => "validation",
        }
    }

    /// Whether a later attempt could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::RateLimit { .. } | CloudError::Network(_))
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CloudError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Why a mutation could not be appended to the outbox.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The offline queue limit was reached and the policy rejects new entries.
    #[error("offline queue limit of {limit} reached")]
    QueueFull { limit: usize },

    /// The operation cannot be queued as given.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The durable journal refused the append.
    #[error("journal write failed: {0}")]
    Journal(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
