//! # Validation Module
//!
//! Receipt payload validation for the fiscal adapter.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: HTTP handler (Rust)                                          │
//! │  ├── Type validation (deserialization)                                 │
//! │  └── THIS MODULE: fiscal business rules                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Buffer (SQLite)                                              │
//! │  ├── NOT NULL constraints                                              │
//! │  └── UNIQUE idempotency_key constraint                                 │
//! │                                                                         │
//! │  A request that fails here is rejected synchronously and is NEVER      │
//! │  written to the buffer.                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,no_run
//! use kassa_core::validation::validate_receipt_request;
//! # let request = todo!();
//!
//! // Validate before assigning an order key or touching the buffer
//! validate_receipt_request(&request).unwrap();
//! ```

use crate::error::ValidationError;
use crate::types::{CreateReceiptRequest, ReceiptItem, ReceiptType};
use crate::{BALANCE_TOLERANCE_CENTS, MAX_ITEM_QUANTITY, MAX_RECEIPT_ITEMS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Field Validators
// =============================================================================

/// Validates a terminal identifier.
///
/// ## Rules
/// - Must not be empty
/// - Must be at most 64 characters
pub fn validate_pos_id(pos_id: &str) -> ValidationResult<()> {
    let pos_id = pos_id.trim();

    if pos_id.is_empty() {
        return Err(ValidationError::Required {
            field: "pos_id".to_string(),
        });
    }

    if pos_id.len() > 64 {
        return Err(ValidationError::TooLong {
            field: "pos_id".to_string(),
            max: 64,
        });
    }

    Ok(())
}

/// Validates a caller-supplied idempotency key.
///
/// ## Rules
/// - Must not be empty
/// - Must be at most 128 characters
pub fn validate_idempotency_key(key: &str) -> ValidationResult<()> {
    let key = key.trim();

    if key.is_empty() {
        return Err(ValidationError::Required {
            field: "idempotency_key".to_string(),
        });
    }

    if key.len() > 128 {
        return Err(ValidationError::TooLong {
            field: "idempotency_key".to_string(),
            max: 128,
        });
    }

    Ok(())
}

/// Validates a tax rate in basis points.
///
/// ## Rules
/// - Must be between 0 and 10000 (0% to 100%)
pub fn validate_tax_rate_bps(bps: u32) -> ValidationResult<()> {
    if bps > 10_000 {
        return Err(ValidationError::OutOfRange {
            field: "tax_rate_bps".to_string(),
            min: 0,
            max: 10_000,
        });
    }

    Ok(())
}

/// Validates a single line item.
///
/// ## Rules
/// - Name present, at most 200 characters
/// - Quantity positive and at most [`MAX_ITEM_QUANTITY`]
/// - Unit price non-negative
/// - Stated line total equals unit price × quantity
pub fn validate_item(item: &ReceiptItem) -> ValidationResult<()> {
    let name = item.name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "item name".to_string(),
        });
    }

    if name.len() > 200 {
        return Err(ValidationError::TooLong {
            field: "item name".to_string(),
            max: 200,
        });
    }

    if item.quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if item.quantity > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    if item.unit_price_cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "unit_price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    // Quantity is bounded above but unit price is caller-controlled, so
    // the product must be checked, not trusted
    let computed = item
        .unit_price_cents
        .checked_mul(item.quantity)
        .ok_or_else(|| ValidationError::Overflow {
            field: "line_total".to_string(),
        })?;

    if computed != item.line_total_cents {
        return Err(ValidationError::LineTotalMismatch {
            name: item.name.clone(),
            stated: item.line_total_cents,
            computed,
        });
    }

    if let Some(bps) = item.tax_rate_bps {
        validate_tax_rate_bps(bps)?;
    }

    Ok(())
}

// =============================================================================
// Request Validator
// =============================================================================

/// Validates a complete receipt submission.
///
/// ## Rules
/// - pos_id and idempotency_key valid
/// - At least one item (bounded by [`MAX_RECEIPT_ITEMS`]) and one payment
/// - Every item passes [`validate_item`]
/// - Every payment amount is positive
/// - Sum of line totals equals sum of payments within
///   [`BALANCE_TOLERANCE_CENTS`]
/// - Refunds and corrections carry `original_receipt_id`
pub fn validate_receipt_request(request: &CreateReceiptRequest) -> ValidationResult<()> {
    validate_pos_id(&request.pos_id)?;
    validate_idempotency_key(&request.idempotency_key)?;

    if request.items.is_empty() {
        return Err(ValidationError::Empty {
            field: "items".to_string(),
        });
    }

    if request.items.len() > MAX_RECEIPT_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_RECEIPT_ITEMS as i64,
        });
    }

    if request.payments.is_empty() {
        return Err(ValidationError::Empty {
            field: "payments".to_string(),
        });
    }

    for item in &request.items {
        validate_item(item)?;
    }

    for payment in &request.payments {
        if payment.amount_cents <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "payment amount".to_string(),
            });
        }
    }

    let items_cents = request
        .items
        .iter()
        .try_fold(0i64, |acc, i| acc.checked_add(i.line_total_cents))
        .ok_or_else(|| ValidationError::Overflow {
            field: "items total".to_string(),
        })?;

    let payments_cents = request
        .payments
        .iter()
        .try_fold(0i64, |acc, p| acc.checked_add(p.amount_cents))
        .ok_or_else(|| ValidationError::Overflow {
            field: "payments total".to_string(),
        })?;

    if (items_cents - payments_cents).abs() > BALANCE_TOLERANCE_CENTS {
        return Err(ValidationError::Unbalanced {
            items_cents,
            payments_cents,
        });
    }

    match request.receipt_type {
        ReceiptType::Refund | ReceiptType::Correction => {
            if request.original_receipt_id.is_none() {
                return Err(ValidationError::MissingOriginalReceipt {
                    receipt_type: request.receipt_type.to_string(),
                });
            }
        }
        ReceiptType::Sale => {}
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentKind, PaymentLine};

    fn item(name: &str, unit: i64, qty: i64) -> ReceiptItem {
        ReceiptItem {
            name: name.to_string(),
            unit_price_cents: unit,
            quantity: qty,
            line_total_cents: unit * qty,
            tax_rate_bps: None,
        }
    }

    fn request(items: Vec<ReceiptItem>, payments: Vec<PaymentLine>) -> CreateReceiptRequest {
        CreateReceiptRequest {
            pos_id: "pos-01".to_string(),
            receipt_type: ReceiptType::Sale,
            idempotency_key: "key-001".to_string(),
            original_receipt_id: None,
            items,
            payments,
        }
    }

    #[test]
    fn test_validate_pos_id() {
        assert!(validate_pos_id("pos-01").is_ok());
        assert!(validate_pos_id("").is_err());
        assert!(validate_pos_id("   ").is_err());
        assert!(validate_pos_id(&"p".repeat(100)).is_err());
    }

    #[test]
    fn test_validate_item_line_total() {
        let mut bad = item("Frame", 1000, 2);
        bad.line_total_cents = 1500; // disagrees with 1000 × 2
        assert!(matches!(
            validate_item(&bad),
            Err(ValidationError::LineTotalMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_item_quantity_bounds() {
        assert!(validate_item(&item("Frame", 1000, 0)).is_err());
        assert!(validate_item(&item("Frame", 1000, -1)).is_err());
        assert!(validate_item(&item("Frame", 1000, 1000)).is_err());
        assert!(validate_item(&item("Frame", 1000, 999)).is_ok());
    }

    #[test]
    fn test_huge_unit_price_rejected_without_panic() {
        // Type-valid but absurd amounts must come back as an error, never
        // wrap or abort
        let huge = ReceiptItem {
            name: "Frame".to_string(),
            unit_price_cents: i64::MAX / 2,
            quantity: 3,
            line_total_cents: 0,
            tax_rate_bps: None,
        };
        assert!(matches!(
            validate_item(&huge),
            Err(ValidationError::Overflow { .. })
        ));
    }

    #[test]
    fn test_item_sum_overflow_rejected() {
        let max_item = ReceiptItem {
            name: "Frame".to_string(),
            unit_price_cents: i64::MAX,
            quantity: 1,
            line_total_cents: i64::MAX,
            tax_rate_bps: None,
        };
        let req = request(
            vec![max_item.clone(), max_item],
            vec![PaymentLine {
                kind: PaymentKind::Card,
                amount_cents: 100,
            }],
        );
        assert!(matches!(
            validate_receipt_request(&req),
            Err(ValidationError::Overflow { .. })
        ));
    }

    #[test]
    fn test_balanced_request_passes() {
        let req = request(
            vec![item("Frame", 1000, 2)],
            vec![PaymentLine {
                kind: PaymentKind::Card,
                amount_cents: 2000,
            }],
        );
        assert!(validate_receipt_request(&req).is_ok());
    }

    #[test]
    fn test_unbalanced_request_rejected() {
        let req = request(
            vec![item("Frame", 1000, 2)],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 1500,
            }],
        );
        assert!(matches!(
            validate_receipt_request(&req),
            Err(ValidationError::Unbalanced { .. })
        ));
    }

    #[test]
    fn test_one_cent_tolerance() {
        let req = request(
            vec![item("Frame", 999, 1)],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 1000,
            }],
        );
        assert!(validate_receipt_request(&req).is_ok());
    }

    #[test]
    fn test_empty_collections_rejected() {
        let req = request(vec![], vec![]);
        assert!(matches!(
            validate_receipt_request(&req),
            Err(ValidationError::Empty { .. })
        ));
    }

    #[test]
    fn test_refund_requires_original() {
        let mut req = request(
            vec![item("Frame", 1000, 1)],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 1000,
            }],
        );
        req.receipt_type = ReceiptType::Refund;
        assert!(matches!(
            validate_receipt_request(&req),
            Err(ValidationError::MissingOriginalReceipt { .. })
        ));

        req.original_receipt_id = Some("orig-123".to_string());
        assert!(validate_receipt_request(&req).is_ok());
    }
}
