//! # Domain Types
//!
//! Core domain types used throughout the kassa fiscal adapter.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Receipt      │   │ FiscalDocument  │   │ DeadLetterEntry │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  items          │   │  receipt_id     │       │
//! │  │  pos_id         │   │  payments       │   │  fiscal_doc     │       │
//! │  │  order_key(HLC) │   │  document_number│   │  final_error    │       │
//! │  │  status         │   │  fiscal_sign    │   │  attempts       │       │
//! │  │  retry_count    │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  ReceiptStatus  │   │  BufferEvent    │   │    TaxRate      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Pending        │   │  event_type     │   │  bps (u32)      │       │
//! │  │  Syncing        │   │  receipt_id?    │   │  825 = 8.25%    │       │
//! │  │  Synced         │   │  metadata       │   └─────────────────┘       │
//! │  │  Failed         │   └─────────────────┘                              │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every receipt has:
//! - `id`: UUID v4 - immutable, generated at insert
//! - `idempotency_key`: caller-supplied - makes retried submissions safe

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::HlcTimestamp;
use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 2000 bps = 20% (e.g., standard VAT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage (for display only).
    #[inline]
    pub fn percentage(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }
}

// =============================================================================
// Receipt Type
// =============================================================================

/// The fiscal operation a receipt represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    /// A regular sale.
    Sale,
    /// A refund of a previous sale. Carries `original_receipt_id`.
    Refund,
    /// A correction of a previously recorded receipt.
    Correction,
}

impl Default for ReceiptType {
    fn default() -> Self {
        ReceiptType::Sale
    }
}

impl std::fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiptType::Sale => write!(f, "sale"),
            ReceiptType::Refund => write!(f, "refund"),
            ReceiptType::Correction => write!(f, "correction"),
        }
    }
}

// =============================================================================
// Receipt Status
// =============================================================================

/// The synchronization status of a buffered receipt.
///
/// ## State Machine
/// ```text
/// pending ──(sync attempt begins)──► syncing ──(remote accepts)──► synced
///    ▲                                  │
///    └──────(remote rejects/times out,──┘
///            retry_count += 1)
///
/// pending ──(retry_count ≥ max)──► [removed, DeadLetterEntry created]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Waiting for a sync attempt.
    Pending,
    /// A sync attempt is in flight.
    Syncing,
    /// The remote operator confirmed the receipt. Terminal.
    Synced,
    /// The retry budget is spent; the receipt is being promoted to the
    /// dead-letter table. Only observed transiently.
    Failed,
}

impl ReceiptStatus {
    /// Returns true if the state machine permits `self -> to`.
    ///
    /// Transitions are monotone except the single `syncing -> pending`
    /// recovery that a failed remote attempt performs.
    pub fn can_transition(&self, to: ReceiptStatus) -> bool {
        use ReceiptStatus::*;
        matches!(
            (self, to),
            (Pending, Syncing) | (Syncing, Synced) | (Syncing, Pending) | (Pending, Failed)
        )
    }

    /// Returns true for states that still occupy buffer capacity.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, ReceiptStatus::Pending | ReceiptStatus::Syncing)
    }
}

impl Default for ReceiptStatus {
    fn default() -> Self {
        ReceiptStatus::Pending
    }
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiptStatus::Pending => write!(f, "pending"),
            ReceiptStatus::Syncing => write!(f, "syncing"),
            ReceiptStatus::Synced => write!(f, "synced"),
            ReceiptStatus::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Payment Kind
// =============================================================================

/// How a payment line was tendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// Physical cash payment.
    Cash,
    /// Card payment on an external terminal.
    Card,
    /// Prepaid/advance or other electronic tender.
    Electronic,
}

// =============================================================================
// Receipt Lines
// =============================================================================

/// A line item on a receipt.
/// Uses the snapshot pattern: product data is frozen at time of sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptItem {
    /// Display name at time of sale (frozen).
    pub name: String,
    /// Unit price in cents at time of sale (frozen).
    pub unit_price_cents: i64,
    /// Quantity sold.
    pub quantity: i64,
    /// Line total in cents (unit_price × quantity), computed by the caller
    /// and re-checked by validation.
    pub line_total_cents: i64,
    /// Optional tax rate in basis points (2000 = 20%).
    pub tax_rate_bps: Option<u32>,
}

impl ReceiptItem {
    /// Returns the unit price as Money.
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    /// Returns the line total as Money.
    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.line_total_cents)
    }

    /// Tax for this line, if a rate is set.
    pub fn line_tax(&self) -> Money {
        match self.tax_rate_bps {
            Some(bps) => self.line_total().calculate_tax(TaxRate::from_bps(bps)),
            None => Money::zero(),
        }
    }
}

/// A payment towards a receipt.
/// A receipt can carry multiple payments for split tender scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLine {
    pub kind: PaymentKind,
    /// Amount paid in cents.
    pub amount_cents: i64,
}

impl PaymentLine {
    /// Returns the payment amount as Money.
    #[inline]
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

// =============================================================================
// Fiscal Document
// =============================================================================

/// The structured payload stored with every receipt and forwarded to the
/// remote fiscal operator.
///
/// Stored as opaque JSON in the buffer; the buffer never interprets it.
/// The print driver fills in `document_number`/`fiscal_sign` during
/// Phase 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalDocument {
    pub receipt_type: ReceiptType,
    pub items: Vec<ReceiptItem>,
    pub payments: Vec<PaymentLine>,
    /// Sum of line totals in cents.
    pub total_cents: i64,
    /// Sum of line taxes in cents.
    pub tax_total_cents: i64,
    /// Local document number synthesized by the print driver.
    pub document_number: Option<String>,
    /// Local fiscal sign synthesized by the print driver.
    pub fiscal_sign: Option<String>,
    /// When the local print completed.
    pub printed_at: Option<DateTime<Utc>>,
}

impl FiscalDocument {
    /// Builds a document from validated request lines, computing totals.
    pub fn from_lines(
        receipt_type: ReceiptType,
        items: Vec<ReceiptItem>,
        payments: Vec<PaymentLine>,
    ) -> Self {
        let total_cents = items.iter().map(|i| i.line_total_cents).sum();
        let tax_total_cents = items.iter().map(|i| i.line_tax().cents()).sum();

        FiscalDocument {
            receipt_type,
            items,
            payments,
            total_cents,
            tax_total_cents,
            document_number: None,
            fiscal_sign: None,
            printed_at: None,
        }
    }

    /// Sum of payment amounts in cents.
    pub fn payments_total_cents(&self) -> i64 {
        self.payments.iter().map(|p| p.amount_cents).sum()
    }
}

// =============================================================================
// Receipt
// =============================================================================

/// A buffered fiscal receipt — the unit of work for the whole adapter.
///
/// Invariants:
/// - `order_key` is assigned exactly once at creation and never mutated
/// - `retry_count` never decreases
/// - `status` transitions follow [`ReceiptStatus::can_transition`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Unique identifier (UUID v4), generated at insert.
    pub id: String,
    /// Origin terminal identifier.
    pub pos_id: String,
    pub receipt_type: ReceiptType,
    /// Caller-supplied deduplication key.
    pub idempotency_key: String,
    /// Explicit lineage for refunds/corrections.
    pub original_receipt_id: Option<String>,
    pub status: ReceiptStatus,
    /// Hybrid timestamp used to totally order receipts despite clock skew.
    pub order_key: HlcTimestamp,
    /// Opaque structured payload (items, payments, tax).
    pub fiscal_document: FiscalDocument,
    /// Attempts made against the remote operator.
    pub retry_count: i64,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Backoff deadline for the next sync attempt. None = due immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Confirmed remote acceptance; absent until `synced`.
    pub synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Dead Letter Entry
// =============================================================================

/// A receipt that exhausted its retry budget.
///
/// Created exactly once per exhausted receipt, in the same transaction
/// that removes the receipt from the active table. Closed only by
/// manual/administrative resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    /// The original receipt id.
    pub receipt_id: String,
    pub pos_id: String,
    /// The original payload, preserved for manual replay.
    pub fiscal_document: FiscalDocument,
    /// The error recorded on the final attempt.
    pub final_error: String,
    /// Total attempts made before giving up.
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

// =============================================================================
// Buffer Events
// =============================================================================

/// What happened, for the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferEventKind {
    /// A receipt was inserted into the buffer.
    Inserted,
    /// A sync attempt began for a receipt.
    SyncStarted,
    /// The remote operator accepted a receipt.
    SyncSucceeded,
    /// A sync attempt failed; the receipt went back to pending.
    SyncFailed,
    /// A receipt was promoted to the dead-letter table.
    MovedToDeadLetter,
    /// The resilience guard opened (remote presumed down).
    CircuitOpened,
    /// The resilience guard closed (remote recovered).
    CircuitClosed,
    /// The sync daemon started.
    DaemonStarted,
    /// The sync daemon stopped.
    DaemonStopped,
}

impl std::fmt::Display for BufferEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BufferEventKind::Inserted => "inserted",
            BufferEventKind::SyncStarted => "sync_started",
            BufferEventKind::SyncSucceeded => "sync_succeeded",
            BufferEventKind::SyncFailed => "sync_failed",
            BufferEventKind::MovedToDeadLetter => "moved_to_dead_letter",
            BufferEventKind::CircuitOpened => "circuit_opened",
            BufferEventKind::CircuitClosed => "circuit_closed",
            BufferEventKind::DaemonStarted => "daemon_started",
            BufferEventKind::DaemonStopped => "daemon_stopped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BufferEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inserted" => Ok(BufferEventKind::Inserted),
            "sync_started" => Ok(BufferEventKind::SyncStarted),
            "sync_succeeded" => Ok(BufferEventKind::SyncSucceeded),
            "sync_failed" => Ok(BufferEventKind::SyncFailed),
            "moved_to_dead_letter" => Ok(BufferEventKind::MovedToDeadLetter),
            "circuit_opened" => Ok(BufferEventKind::CircuitOpened),
            "circuit_closed" => Ok(BufferEventKind::CircuitClosed),
            "daemon_started" => Ok(BufferEventKind::DaemonStarted),
            "daemon_stopped" => Ok(BufferEventKind::DaemonStopped),
            other => Err(format!("unknown buffer event kind: {other}")),
        }
    }
}

/// An append-only audit record. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEvent {
    /// Monotonic row id assigned by the store.
    pub id: i64,
    pub event_type: BufferEventKind,
    pub receipt_id: Option<String>,
    /// Free-form JSON context (attempt count, error detail, ...).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Buffer Status
// =============================================================================

/// Aggregated buffer occupancy for observability surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Fixed ceiling on active (pending/syncing) receipts.
    pub capacity: u32,
    /// Current count of active receipts.
    pub active: u32,
    /// active / capacity, 0–100.
    pub percent_full: f64,
    pub pending: u32,
    pub syncing: u32,
    pub synced: u32,
    pub failed: u32,
    pub dead_letters: u32,
}

// =============================================================================
// Receipt Request
// =============================================================================

/// The inbound receipt submission, as consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReceiptRequest {
    /// Origin terminal identifier.
    pub pos_id: String,
    #[serde(default)]
    pub receipt_type: ReceiptType,
    /// Caller-supplied deduplication key.
    pub idempotency_key: String,
    /// Required for refund/correction receipts.
    #[serde(default)]
    pub original_receipt_id: Option<String>,
    pub items: Vec<ReceiptItem>,
    pub payments: Vec<PaymentLine>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_rate_from_bps() {
        let rate = TaxRate::from_bps(2000);
        assert_eq!(rate.bps(), 2000);
        assert!((rate.percentage() - 20.0).abs() < 0.001);
    }

    #[test]
    fn test_status_transitions() {
        use ReceiptStatus::*;

        assert!(Pending.can_transition(Syncing));
        assert!(Syncing.can_transition(Synced));
        assert!(Syncing.can_transition(Pending));
        assert!(Pending.can_transition(Failed));

        // Terminal / illegal moves
        assert!(!Synced.can_transition(Syncing));
        assert!(!Synced.can_transition(Pending));
        assert!(!Pending.can_transition(Synced));
        assert!(!Failed.can_transition(Pending));
    }

    #[test]
    fn test_active_states() {
        assert!(ReceiptStatus::Pending.is_active());
        assert!(ReceiptStatus::Syncing.is_active());
        assert!(!ReceiptStatus::Synced.is_active());
        assert!(!ReceiptStatus::Failed.is_active());
    }

    #[test]
    fn test_fiscal_document_totals() {
        let doc = FiscalDocument::from_lines(
            ReceiptType::Sale,
            vec![
                ReceiptItem {
                    name: "Lens cleaning kit".into(),
                    unit_price_cents: 1250,
                    quantity: 2,
                    line_total_cents: 2500,
                    tax_rate_bps: Some(2000),
                },
                ReceiptItem {
                    name: "Case".into(),
                    unit_price_cents: 500,
                    quantity: 1,
                    line_total_cents: 500,
                    tax_rate_bps: None,
                },
            ],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 3000,
            }],
        );

        assert_eq!(doc.total_cents, 3000);
        assert_eq!(doc.tax_total_cents, 500); // 20% of 2500
        assert_eq!(doc.payments_total_cents(), 3000);
        assert!(doc.document_number.is_none());
    }

    #[test]
    fn test_event_kind_round_trip() {
        let kinds = [
            BufferEventKind::Inserted,
            BufferEventKind::SyncStarted,
            BufferEventKind::SyncSucceeded,
            BufferEventKind::SyncFailed,
            BufferEventKind::MovedToDeadLetter,
            BufferEventKind::CircuitOpened,
            BufferEventKind::CircuitClosed,
            BufferEventKind::DaemonStarted,
            BufferEventKind::DaemonStopped,
        ];
        for kind in kinds {
            let parsed: BufferEventKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("no_such_event".parse::<BufferEventKind>().is_err());
    }
}
