//! Error types for `pushsub` core library.

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::store::StoreError;

/// Result type alias using `pushsub` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The subscription store rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The dispatcher refused a delivery job.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A row kept changing underneath a read-modify-write cycle.
    #[error("Concurrent update conflict for subscriber {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the whole operation later.
    ///
    /// Lifecycle methods never retry store access themselves.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Unavailable(_))
                | Self::Conflict(_)
                | Self::Dispatch(DispatchError::Unavailable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_is_retryable() {
        let err = Error::from(StoreError::Unavailable("locked".into()));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn corrupt_row_is_not_retryable() {
        let err = Error::from(StoreError::Corrupt("bad state".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_unavailable_dispatcher_is_retryable() {
        assert!(Error::from(DispatchError::Unavailable("outbox locked".into())).is_retryable());
        assert!(!Error::from(DispatchError::Rejected("unknown kind".into())).is_retryable());
    }

    #[test]
    fn config_error_is_not_retryable() {
        assert!(!Error::Config("missing".into()).is_retryable());
    }
}
