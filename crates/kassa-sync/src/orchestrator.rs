//! # Fiscalization Orchestrator
//!
//! Phase 1 of two-phase fiscalization: validate, order, buffer, print.
//!
//! ## Two-Phase Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Two-Phase Fiscalization                             │
//! │                                                                         │
//! │  PHASE 1 (synchronous, must finish in milliseconds):                    │
//! │    validate request ─► hybrid clock stamp ─► durable buffer insert     │
//! │    ─► local print ─► acknowledge to POS caller                         │
//! │                                                                         │
//! │    The customer walks away with a paper receipt. The OFD has not       │
//! │    been involved at all; connectivity CANNOT block a sale.             │
//! │                                                                         │
//! │  PHASE 2 (asynchronous, sync daemon):                                   │
//! │    drain buffer ─► submit to OFD ─► operator confirmation              │
//! │                                                                         │
//! │  A crashed terminal replays Phase 1 safely: the idempotency key        │
//! │  returns the original receipt, and an unprinted document is printed    │
//! │  on the retry.                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use kassa_buffer::{Buffer, NewReceipt};
use kassa_core::{
    validate_receipt_request, BufferStatus, CreateReceiptRequest, FiscalDocument, HybridClock,
    Receipt,
};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::daemon::{CycleReport, SyncDaemonHandle};
use crate::error::SyncResult;
use crate::printer::PrintDriver;

// =============================================================================
// Outcome
// =============================================================================

/// Result of a Phase 1 fiscalization.
#[derive(Debug, Clone)]
pub struct FiscalizationOutcome {
    /// The buffered receipt (status `pending` until Phase 2 confirms it).
    pub receipt: Receipt,

    /// True when the idempotency key matched a previous submission and no
    /// new receipt was created.
    pub deduplicated: bool,
}

/// Buffer occupancy joined with the circuit state, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatusReport {
    #[serde(flatten)]
    pub buffer: BufferStatus,
    /// Circuit breaker state (`closed`, `open`, `half_open`).
    pub circuit: String,
}

/// Phase 2 health snapshot.
#[derive(Debug, Clone)]
pub struct Phase2Health {
    /// Whether the durable buffer accepts queries.
    pub buffer_ok: bool,
    /// Circuit breaker state against the operator.
    pub circuit: CircuitState,
    /// Active (pending/syncing) receipts, when the buffer is reachable.
    pub buffered: Option<u32>,
    /// Outcome of the most recent sync cycle, when a daemon is attached.
    pub last_cycle: Option<CycleReport>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives Phase 1 and exposes receipt/buffer reads to the HTTP surface.
pub struct Orchestrator {
    buffer: Buffer,
    clock: Arc<HybridClock>,
    printer: Arc<dyn PrintDriver>,
    breaker: Arc<CircuitBreaker>,
    daemon: Option<SyncDaemonHandle>,
    pos_id: String,
}

impl Orchestrator {
    /// Creates a new orchestrator.
    pub fn new(
        buffer: Buffer,
        clock: Arc<HybridClock>,
        printer: Arc<dyn PrintDriver>,
        breaker: Arc<CircuitBreaker>,
        pos_id: impl Into<String>,
    ) -> Self {
        Orchestrator {
            buffer,
            clock,
            printer,
            breaker,
            daemon: None,
            pos_id: pos_id.into(),
        }
    }

    /// Attaches the sync daemon handle so health reports include the last
    /// cycle outcome.
    pub fn with_daemon(mut self, daemon: SyncDaemonHandle) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// Processes one receipt request end to end through Phase 1.
    ///
    /// ## Ordering Guarantee
    /// Durability comes FIRST: the receipt is committed to the buffer
    /// before the printer is touched. A printer fault after that point
    /// cannot lose the sale; the retry (same idempotency key) prints the
    /// already-buffered document.
    pub async fn process(
        &self,
        mut request: CreateReceiptRequest,
    ) -> SyncResult<FiscalizationOutcome> {
        // A caller that omits pos_id gets this terminal's configured one
        if request.pos_id.trim().is_empty() {
            request.pos_id = self.pos_id.clone();
        }

        validate_receipt_request(&request)?;

        let document = FiscalDocument::from_lines(
            request.receipt_type,
            request.items.clone(),
            request.payments.clone(),
        );

        let outcome = self
            .buffer
            .receipts()
            .insert(NewReceipt {
                pos_id: request.pos_id.clone(),
                receipt_type: request.receipt_type,
                idempotency_key: request.idempotency_key.clone(),
                original_receipt_id: request.original_receipt_id.clone(),
                order_key: self.clock.generate(),
                fiscal_document: document,
            })
            .await?;

        let mut receipt = outcome.receipt;

        if outcome.deduplicated {
            info!(
                receipt_id = %receipt.id,
                idempotency_key = %request.idempotency_key,
                "Duplicate submission, returning original receipt"
            );
        }

        // Print if this document never made it to paper (first attempt, or
        // a retry after a printer fault)
        if receipt.fiscal_document.document_number.is_none() {
            match self.printer.print(&receipt.fiscal_document).await {
                Ok(printed) => {
                    self.buffer
                        .receipts()
                        .update_document(&receipt.id, &printed)
                        .await?;
                    receipt.fiscal_document = printed;
                }
                Err(e) => {
                    // The sale is already durable; surface the fault but
                    // keep the receipt. The caller retries the same key.
                    warn!(receipt_id = %receipt.id, error = %e, "Local print failed");
                    return Err(e);
                }
            }
        }

        info!(
            receipt_id = %receipt.id,
            order_key = %receipt.order_key,
            deduplicated = outcome.deduplicated,
            "Receipt fiscalized (phase 1)"
        );

        Ok(FiscalizationOutcome {
            receipt,
            deduplicated: outcome.deduplicated,
        })
    }

    /// Fetches a receipt by id.
    pub async fn get_receipt(&self, id: &str) -> SyncResult<Receipt> {
        Ok(self.buffer.receipts().get(id).await?)
    }

    /// Aggregated buffer occupancy, per-state counts, and circuit state.
    pub async fn buffer_status(&self) -> SyncResult<BufferStatusReport> {
        let buffer = self.buffer.status().await?;
        Ok(BufferStatusReport {
            buffer,
            circuit: self.breaker.state().to_string(),
        })
    }

    /// Phase 2 health: circuit state, occupancy, last cycle, buffer
    /// accessibility. Never errors; an unreachable buffer IS the report.
    pub async fn phase2_health(&self) -> Phase2Health {
        let buffer_ok = self.buffer.health_check().await;
        let buffered = if buffer_ok {
            self.buffer.status().await.ok().map(|s| s.active)
        } else {
            None
        };

        Phase2Health {
            buffer_ok,
            circuit: self.breaker.state(),
            buffered,
            last_cycle: self.daemon.as_ref().map(|d| d.last_report()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::printer::StubPrintDriver;
    use kassa_buffer::BufferConfig;
    use kassa_core::{PaymentKind, PaymentLine, ReceiptItem, ReceiptStatus, ReceiptType};

    async fn orchestrator() -> (Orchestrator, Arc<StubPrintDriver>) {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let printer = Arc::new(StubPrintDriver::new());
        let breaker = Arc::new(CircuitBreaker::new(5, 1, std::time::Duration::from_secs(60)));
        let orch = Orchestrator::new(
            buffer,
            Arc::new(HybridClock::new()),
            printer.clone(),
            breaker,
            "pos-01",
        );
        (orch, printer)
    }

    fn request(key: &str) -> CreateReceiptRequest {
        CreateReceiptRequest {
            pos_id: "pos-01".into(),
            receipt_type: ReceiptType::Sale,
            idempotency_key: key.into(),
            original_receipt_id: None,
            items: vec![ReceiptItem {
                name: "Reading glasses".into(),
                unit_price_cents: 2450,
                quantity: 2,
                line_total_cents: 4900,
                tax_rate_bps: Some(2000),
            }],
            payments: vec![PaymentLine {
                kind: PaymentKind::Card,
                amount_cents: 4900,
            }],
        }
    }

    #[tokio::test]
    async fn test_phase1_buffers_and_prints() {
        let (orch, _) = orchestrator().await;

        let outcome = orch.process(request("k1")).await.unwrap();
        assert!(!outcome.deduplicated);

        let receipt = &outcome.receipt;
        assert_eq!(receipt.status, ReceiptStatus::Pending);
        assert_eq!(receipt.fiscal_document.total_cents, 4900);
        assert!(receipt.fiscal_document.document_number.is_some());
        assert!(receipt.fiscal_document.printed_at.is_some());

        // The printed document is what the buffer holds
        let stored = orch.get_receipt(&receipt.id).await.unwrap();
        assert_eq!(
            stored.fiscal_document.document_number,
            receipt.fiscal_document.document_number
        );
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_original() {
        let (orch, _) = orchestrator().await;

        let first = orch.process(request("k1")).await.unwrap();
        let second = orch.process(request("k1")).await.unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.receipt.id, second.receipt.id);
        assert_eq!(
            first.receipt.fiscal_document.document_number,
            second.receipt.fiscal_document.document_number
        );

        let status = orch.buffer_status().await.unwrap();
        assert_eq!(status.buffer.active, 1);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_buffering() {
        let (orch, _) = orchestrator().await;

        let mut bad = request("k1");
        bad.payments[0].amount_cents = 100; // unbalanced

        assert!(matches!(
            orch.process(bad).await,
            Err(SyncError::Validation(_))
        ));

        let status = orch.buffer_status().await.unwrap();
        assert_eq!(status.buffer.active, 0);
    }

    #[tokio::test]
    async fn test_printer_fault_keeps_receipt_buffered() {
        let (orch, printer) = orchestrator().await;

        printer.set_failing(true);
        let err = orch.process(request("k1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Print(_)));

        // The sale is durable despite the fault
        let status = orch.buffer_status().await.unwrap();
        assert_eq!(status.buffer.active, 1);

        // The retry with the same key prints the buffered document
        printer.set_failing(false);
        let outcome = orch.process(request("k1")).await.unwrap();
        assert!(outcome.deduplicated);
        assert!(outcome.receipt.fiscal_document.document_number.is_some());

        let status = orch.buffer_status().await.unwrap();
        assert_eq!(status.buffer.active, 1);
    }

    #[tokio::test]
    async fn test_refund_requires_original_receipt() {
        let (orch, _) = orchestrator().await;

        let mut refund = request("k1");
        refund.receipt_type = ReceiptType::Refund;

        assert!(orch.process(refund.clone()).await.is_err());

        refund.original_receipt_id = Some("some-original".into());
        let outcome = orch.process(refund).await.unwrap();
        assert_eq!(outcome.receipt.receipt_type, ReceiptType::Refund);
        assert_eq!(
            outcome.receipt.original_receipt_id.as_deref(),
            Some("some-original")
        );
    }

    #[tokio::test]
    async fn test_phase2_health_reports_circuit_and_occupancy() {
        let (orch, _) = orchestrator().await;
        orch.process(request("k1")).await.unwrap();

        let health = orch.phase2_health().await;
        assert!(health.buffer_ok);
        assert_eq!(health.circuit, CircuitState::Closed);
        assert_eq!(health.buffered, Some(1));
        // No daemon attached in this fixture
        assert!(health.last_cycle.is_none());
    }

    #[tokio::test]
    async fn test_receipts_get_strictly_increasing_order_keys() {
        let (orch, _) = orchestrator().await;

        let first = orch.process(request("k1")).await.unwrap();
        let second = orch.process(request("k2")).await.unwrap();

        assert!(second.receipt.order_key > first.receipt.order_key);
    }
}
