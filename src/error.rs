//! Contains the errors reported by the cache coordinators.
//!
//! All public operations of a [Cacher](crate::cacher::Cacher) return a [CacheError]. As a single
//! outcome of a fetch is handed to every coalesced caller, the error is **Clone** and wraps
//! foreign errors in an **Arc**.
//!
//! Use [CacheError::kind] to distinguish "gave up" (cancelled, deadline exceeded, wait timeout)
//! from "failed" (store, codec, fetch).
use std::sync::Arc;
use std::time::Duration;

/// Shorthand for results of the public cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Classifies a [CacheError].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed an unusable key.
    InvalidKey,
    /// The backing store was unreachable or rejected an operation.
    Store,
    /// A stored value could not be encoded or decoded.
    Codec,
    /// The user supplied fetch function failed.
    Fetch,
    /// A waiting caller gave up as the winner didn't publish a value in time.
    WaitTimeout,
    /// The lock vanished without a value being published (the winning fetch most probably
    /// failed).
    NotPopulated,
    /// The caller's context was cancelled.
    Cancelled,
    /// The caller's deadline has passed.
    DeadlineExceeded,
}

/// Describes why a cache operation failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Cache keys must not be empty.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// A store operation failed.
    #[error("store operation '{operation}' failed: {error:#}")]
    Store {
        /// The store operation which failed (e.g. "get" or "scan").
        operation: &'static str,
        /// The error reported by the store.
        error: Arc<anyhow::Error>,
    },

    /// Encoding or decoding a value failed.
    #[error("failed to {operation} cached value: {error}")]
    Codec {
        /// Either "encode" or "decode".
        operation: &'static str,
        /// The error reported by the codec.
        error: Arc<serde_json::Error>,
    },

    /// The fetch function returned an error (which is never cached).
    #[error("fetch function failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),

    /// The winning fetch didn't publish a value within the wait deadline.
    #[error("timeout waiting for cache after {0:?}")]
    WaitTimeout(Duration),

    /// The lock vanished but no value was published.
    #[error("fetch operation failed or cache not populated")]
    NotPopulated,

    /// The caller's context was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The caller's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A bulk operation stopped part-way. **deleted** entries were already removed.
    #[error("interrupted after deleting {deleted} entries: {cause}")]
    Interrupted {
        /// The number of entries removed before the interruption.
        deleted: usize,
        /// The reason for the interruption.
        cause: Box<CacheError>,
    },
}

impl CacheError {
    /// Wraps an error reported by a store operation.
    pub fn store(operation: &'static str, error: anyhow::Error) -> Self {
        CacheError::Store {
            operation,
            error: Arc::new(error),
        }
    }

    /// Wraps an error reported by the user supplied fetch function.
    pub fn fetch(error: anyhow::Error) -> Self {
        CacheError::Fetch(Arc::new(error))
    }

    /// Returns the category of this error.
    ///
    /// For an interrupted bulk operation, this is the kind of the underlying cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidKey(_) => ErrorKind::InvalidKey,
            CacheError::Store { .. } => ErrorKind::Store,
            CacheError::Codec { .. } => ErrorKind::Codec,
            CacheError::Fetch(_) => ErrorKind::Fetch,
            CacheError::WaitTimeout(_) => ErrorKind::WaitTimeout,
            CacheError::NotPopulated => ErrorKind::NotPopulated,
            CacheError::Cancelled => ErrorKind::Cancelled,
            CacheError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            CacheError::Interrupted { cause, .. } => cause.kind(),
        }
    }

    /// Determines if the caller gave up (cancelled or deadline exceeded).
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded
        )
    }

    /// Returns the error of the fetch function, exactly as it was returned.
    pub fn fetch_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Fetch(error) => Some(error),
            _ => None,
        }
    }

    /// Returns the number of entries a bulk operation removed before it failed.
    pub fn deleted_before_failure(&self) -> usize {
        match self {
            CacheError::Interrupted { deleted, .. } => *deleted,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{CacheError, ErrorKind};

    #[test]
    fn interrupted_errors_report_their_cause() {
        let error = CacheError::Interrupted {
            deleted: 3,
            cause: Box::new(CacheError::Cancelled),
        };

        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert_eq!(error.is_cancellation(), true);
        assert_eq!(error.deleted_before_failure(), 3);
        assert_eq!(
            error.to_string(),
            "interrupted after deleting 3 entries: context cancelled"
        );
    }

    #[test]
    fn fetch_errors_are_kept_verbatim() {
        let error = CacheError::fetch(anyhow::anyhow!("database offline"));

        assert_eq!(error.kind(), ErrorKind::Fetch);
        assert_eq!(error.is_cancellation(), false);
        assert_eq!(
            error.fetch_error().unwrap().to_string(),
            "database offline"
        );
        assert_eq!(error.to_string(), "fetch function failed: database offline");
    }

    #[test]
    fn store_errors_name_the_operation() {
        let error = CacheError::store("scan", anyhow::anyhow!("connection reset"));
        assert_eq!(error.kind(), ErrorKind::Store);
        assert_eq!(
            error.to_string(),
            "store operation 'scan' failed: connection reset"
        );
    }
}
