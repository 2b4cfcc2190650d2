//! # Buffer Error Types
//!
//! Error types for durable buffer operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BufferError (this module) ← Adds context and categorization           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ApiError (adapter app) ← Serialized for the POS/ERP caller            │
//! │                                                                         │
//! │  CapacityExceeded is the one variant callers must treat specially:     │
//! │  it is backpressure, not a transient fault to retry.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use kassa_core::ReceiptStatus;

/// Durable buffer operation errors.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Receipt (or dead-letter entry) not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The buffer holds the configured maximum of active receipts.
    ///
    /// ## When This Occurs
    /// - Count of pending/syncing receipts reached the fixed ceiling
    ///
    /// ## Caller Contract
    /// This is backpressure. The caller must slow down or shed load
    /// upstream; retrying immediately will fail again until the sync
    /// daemon drains the buffer.
    #[error("Buffer full: {active} active receipts at capacity {capacity}")]
    CapacityExceeded { active: u32, capacity: u32 },

    /// A status update that the receipt state machine forbids.
    ///
    /// ## When This Occurs
    /// - Two daemon instances racing on the same receipt (lock failure)
    /// - Marking a receipt that a concurrent cycle already resolved
    #[error("Receipt {id}: illegal transition to {to:?}")]
    IllegalTransition { id: String, to: ReceiptStatus },

    /// The stored fiscal document payload failed to (de)serialize.
    #[error("Corrupt fiscal document for receipt {id}: {reason}")]
    CorruptPayload { id: String, reason: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal storage error. I/O failures land here and are fatal to
    /// the service: a buffer that cannot persist must fail health checks
    /// rather than accept receipts.
    #[error("Internal buffer error: {0}")]
    Internal(String),
}

impl BufferError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        BufferError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True when the error is the capacity backpressure signal.
    pub fn is_capacity(&self) -> bool {
        matches!(self, BufferError::CapacityExceeded { .. })
    }
}

/// Convert sqlx errors to BufferError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → BufferError::NotFound
/// sqlx::Error::Database       → BufferError::QueryFailed
/// sqlx::Error::PoolTimedOut   → BufferError::PoolExhausted
/// Other                       → BufferError::Internal
/// ```
impl From<sqlx::Error> for BufferError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BufferError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => BufferError::QueryFailed(db_err.message().to_string()),

            sqlx::Error::PoolTimedOut => BufferError::PoolExhausted,

            sqlx::Error::PoolClosed => BufferError::ConnectionFailed("Pool is closed".to_string()),

            _ => BufferError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for BufferError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BufferError::MigrationFailed(err.to_string())
    }
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;
