//! # Error Types
//!
//! Domain-specific error types for kassa-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  kassa-core errors (this file)                                         │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Receipt payload validation failures            │
//! │                                                                         │
//! │  kassa-buffer errors (separate crate)                                  │
//! │  └── BufferError      - Storage operation failures                     │
//! │                                                                         │
//! │  kassa-sync errors (separate crate)                                    │
//! │  └── SyncError        - Remote fiscalization failures                  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → BufferError → ApiError → Caller   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (receipt id, field, etc.)
//! 3. Errors are enum variants, never String
//! 4. A validation error is rejected synchronously and never buffered

use thiserror::Error;

use crate::types::ReceiptStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// These errors represent business rule violations or domain logic failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A receipt status transition that the state machine forbids.
    ///
    /// ## When This Occurs
    /// - Marking a `synced` receipt as `syncing` again
    /// - Reverting a terminal receipt to `pending`
    #[error("Illegal receipt transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ReceiptStatus,
        to: ReceiptStatus,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Receipt payload validation errors.
///
/// These errors occur when a submitted receipt request doesn't meet
/// requirements. They are rejected synchronously; a malformed receipt is
/// never written to the buffer.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A collection that must carry at least one element is empty.
    #[error("{field} must not be empty")]
    Empty { field: String },

    /// An amount computation does not fit in 64-bit cents.
    #[error("{field} exceeds the representable amount")]
    Overflow { field: String },

    /// A stated line total disagrees with unit price × quantity.
    #[error("line total for '{name}' is {stated} cents, computed {computed}")]
    LineTotalMismatch {
        name: String,
        stated: i64,
        computed: i64,
    },

    /// Sum of line totals and sum of payments differ beyond tolerance.
    #[error("receipt does not balance: items {items_cents} cents, payments {payments_cents} cents")]
    Unbalanced {
        items_cents: i64,
        payments_cents: i64,
    },

    /// A refund or correction submitted without its original receipt id.
    #[error("{receipt_type} requires original_receipt_id")]
    MissingOriginalReceipt { receipt_type: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ValidationError::Unbalanced {
            items_cents: 1099,
            payments_cents: 1000,
        };
        assert_eq!(
            err.to_string(),
            "receipt does not balance: items 1099 cents, payments 1000 cents"
        );
    }

    #[test]
    fn test_transition_error_message() {
        let err = CoreError::InvalidTransition {
            from: ReceiptStatus::Synced,
            to: ReceiptStatus::Syncing,
        };
        assert!(err.to_string().contains("Synced"));
        assert!(err.to_string().contains("Syncing"));
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "pos_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
