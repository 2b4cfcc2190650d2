//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   OFD Remote    │  │      Local              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Ofd(OfdError)  │  │  Buffer                 │ │
//! │  │                 │  │                 │  │  Validation             │ │
//! │  │                 │  │                 │  │  Print                  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  `is_retryable()` drives the daemon: retryable failures consume a      │
//! │  retry and get a backoff deadline; non-retryable failures skip        │
//! │  straight to the dead-letter queue.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use kassa_buffer::BufferError;
use kassa_core::ValidationError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors from the remote fiscal data operator (or the transport to it).
#[derive(Debug, Error)]
pub enum OfdError {
    /// Could not reach the operator at all (DNS, TCP, TLS).
    #[error("OFD unreachable: {0}")]
    Unreachable(String),

    /// The request was sent but no answer arrived in time.
    ///
    /// The outcome on the operator side is unknown. Submission is keyed
    /// by receipt id, so retrying is safe.
    #[error("OFD request timed out after {0} seconds")]
    Timeout(u64),

    /// The operator answered with a transient failure (5xx, throttling).
    #[error("OFD server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// The operator rejected the document itself (4xx).
    ///
    /// Retrying an identical payload cannot succeed.
    #[error("OFD rejected document ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The operator answered with a body we could not parse.
    #[error("Malformed OFD response: {0}")]
    MalformedResponse(String),
}

impl OfdError {
    /// True when retrying the same submission could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OfdError::Rejected { .. })
    }
}

/// Sync engine error type.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Error from the fiscal data operator.
    #[error(transparent)]
    Ofd(#[from] OfdError),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Durable buffer operation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Receipt failed validation before buffering.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Local print driver failure.
    #[error("Print failed: {0}")]
    Print(String),

    /// Lease lock backend failure (Redis unreachable etc.).
    ///
    /// The daemon treats this as "lock not acquired" and skips the cycle;
    /// buffered receipts are unaffected.
    #[error("Lease lock error: {0}")]
    Lock(String),

    /// Internal sync engine error.
    #[error("Internal sync error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Internal(format!("serialization failed: {err}"))
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        SyncError::Lock(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the failed submission may be retried later.
    ///
    /// ## Retryable
    /// - Network failures, timeouts, operator 5xx
    ///
    /// ## Non-Retryable
    /// - Operator 4xx rejection: the document itself is bad, and
    ///   resubmitting the same payload cannot succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Ofd(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Ofd(OfdError::Unreachable("refused".into())).is_retryable());
        assert!(SyncError::Ofd(OfdError::Timeout(10)).is_retryable());
        assert!(SyncError::Ofd(OfdError::ServerError {
            status: 503,
            message: "overloaded".into()
        })
        .is_retryable());

        assert!(!SyncError::Ofd(OfdError::Rejected {
            status: 422,
            message: "bad tax rate".into()
        })
        .is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = OfdError::ServerError {
            status: 502,
            message: "bad gateway".into(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }
}
