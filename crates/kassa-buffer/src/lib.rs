//! # Kassa Buffer
//!
//! Durable SQLite-backed receipt buffer for the fiscal adapter.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         kassa-buffer                                    │
//! │                                                                         │
//! │  ┌───────────────┐     ┌──────────────────────────────────────────┐    │
//! │  │    Buffer     │────►│  ReceiptRepository                       │    │
//! │  │ (pool handle) │     │  insert / state machine / due batches    │    │
//! │  └───────┬───────┘     ├──────────────────────────────────────────┤    │
//! │          │             │  DeadLetterRepository                    │    │
//! │          │             │  list / resolve exhausted receipts       │    │
//! │          │             ├──────────────────────────────────────────┤    │
//! │          │             │  EventRepository                         │    │
//! │          │             │  append-only audit log                   │    │
//! │          │             └──────────────────────────────────────────┘    │
//! │          ▼                                                              │
//! │   SQLite (WAL, synchronous=FULL, embedded migrations)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! - **Durability before acknowledgment**: every commit is fsynced; once an
//!   insert returns Ok the receipt survives power loss
//! - **Single transaction per mutation**: row change + audit event commit
//!   together, so the store is never observed half-transitioned
//! - **Repository pattern**: all storage access goes through typed
//!   repositories; no raw SQL outside this crate

pub mod error;
pub mod migrations;
pub mod repository;
pub mod store;

pub use error::{BufferError, BufferResult};
pub use repository::dead_letter::DeadLetterRepository;
pub use repository::event::EventRepository;
pub use repository::receipt::{InsertOutcome, NewReceipt, ReceiptRepository, StatusCounts};
pub use store::{Buffer, BufferConfig, DEFAULT_CAPACITY};

// =============================================================================
// Crash-Recovery Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kassa_core::{
        FiscalDocument, HybridClock, PaymentKind, PaymentLine, ReceiptItem, ReceiptStatus,
        ReceiptType,
    };

    fn new_receipt(clock: &HybridClock, key: &str) -> NewReceipt {
        NewReceipt {
            pos_id: "pos-01".into(),
            receipt_type: ReceiptType::Sale,
            idempotency_key: key.into(),
            original_receipt_id: None,
            order_key: clock.generate(),
            fiscal_document: FiscalDocument::from_lines(
                ReceiptType::Sale,
                vec![ReceiptItem {
                    name: "Contact lens solution".into(),
                    unit_price_cents: 1250,
                    quantity: 1,
                    line_total_cents: 1250,
                    tax_rate_bps: Some(1000),
                }],
                vec![PaymentLine {
                    kind: PaymentKind::Cash,
                    amount_cents: 1250,
                }],
            ),
        }
    }

    /// A buffered receipt survives a full close/reopen cycle, including a
    /// sync attempt stranded mid-flight.
    #[tokio::test]
    async fn test_reopen_preserves_buffered_receipts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        let clock = HybridClock::new();

        let (committed_id, stranded_id) = {
            let buffer = Buffer::open(BufferConfig::new(&path)).await.unwrap();
            let repo = buffer.receipts();

            let committed = repo.insert(new_receipt(&clock, "k1")).await.unwrap();
            let stranded = repo.insert(new_receipt(&clock, "k2")).await.unwrap();

            // Simulate a crash mid-cycle: one receipt stuck in syncing
            repo.mark_syncing(&stranded.receipt.id).await.unwrap();

            buffer.close().await;
            (committed.receipt.id, stranded.receipt.id)
        };

        // "Restart": reopen the same file, run startup recovery
        let buffer = Buffer::open(BufferConfig::new(&path)).await.unwrap();
        let repo = buffer.receipts();

        let recovered = repo.recover_stranded().await.unwrap();
        assert_eq!(recovered, 1);

        let committed = repo.get(&committed_id).await.unwrap();
        assert_eq!(committed.status, ReceiptStatus::Pending);
        assert_eq!(committed.fiscal_document.total_cents, 1250);

        let stranded = repo.get(&stranded_id).await.unwrap();
        assert_eq!(stranded.status, ReceiptStatus::Pending);
        assert_eq!(stranded.retry_count, 0);
    }

    /// Idempotency keys deduplicate across restarts, not just in-process.
    #[tokio::test]
    async fn test_idempotency_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        let clock = HybridClock::new();

        let original_id = {
            let buffer = Buffer::open(BufferConfig::new(&path)).await.unwrap();
            let outcome = buffer.receipts().insert(new_receipt(&clock, "k1")).await.unwrap();
            buffer.close().await;
            outcome.receipt.id
        };

        let buffer = Buffer::open(BufferConfig::new(&path)).await.unwrap();
        let retry = buffer.receipts().insert(new_receipt(&clock, "k1")).await.unwrap();

        assert!(retry.deduplicated);
        assert_eq!(retry.receipt.id, original_id);
    }
}
