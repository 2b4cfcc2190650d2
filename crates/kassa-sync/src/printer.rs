//! # Print Driver
//!
//! Phase 1 of fiscalization: the local fiscal printer.
//!
//! The printer assigns a terminal-local document number and a print
//! timestamp. Printing happens AFTER the receipt is durably buffered, so
//! a printer fault never loses a receipt; the buffered copy simply lacks
//! a local document number until reprinted.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use kassa_core::FiscalDocument;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Trait
// =============================================================================

/// Local fiscal printer.
#[async_trait]
pub trait PrintDriver: Send + Sync {
    /// Prints the document and returns a copy stamped with the local
    /// document number and print time.
    async fn print(&self, document: &FiscalDocument) -> SyncResult<FiscalDocument>;
}

// =============================================================================
// Stub Driver
// =============================================================================

/// In-process print driver: sequential document numbers, no hardware.
///
/// Used for development and tests; a real ESC/POS or fiscal-module driver
/// implements the same trait.
#[derive(Debug, Default)]
pub struct StubPrintDriver {
    counter: AtomicU64,
    fail: AtomicBool,
}

impl StubPrintDriver {
    /// Creates a stub starting at document number 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent prints fail (paper-out simulation for tests).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PrintDriver for StubPrintDriver {
    async fn print(&self, document: &FiscalDocument) -> SyncResult<FiscalDocument> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Print("printer offline".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut printed = document.clone();
        printed.document_number = Some(format!("{n:06}"));
        printed.printed_at = Some(Utc::now());

        debug!(document_number = %n, "Receipt printed");
        Ok(printed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kassa_core::{PaymentKind, PaymentLine, ReceiptItem, ReceiptType};

    fn document() -> FiscalDocument {
        FiscalDocument::from_lines(
            ReceiptType::Sale,
            vec![ReceiptItem {
                name: "Lens case".into(),
                unit_price_cents: 300,
                quantity: 1,
                line_total_cents: 300,
                tax_rate_bps: None,
            }],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 300,
            }],
        )
    }

    #[tokio::test]
    async fn test_sequential_document_numbers() {
        let driver = StubPrintDriver::new();

        let first = driver.print(&document()).await.unwrap();
        let second = driver.print(&document()).await.unwrap();

        assert_eq!(first.document_number.as_deref(), Some("000001"));
        assert_eq!(second.document_number.as_deref(), Some("000002"));
        assert!(first.printed_at.is_some());
    }

    #[tokio::test]
    async fn test_failing_driver() {
        let driver = StubPrintDriver::new();
        driver.set_failing(true);

        assert!(matches!(
            driver.print(&document()).await,
            Err(SyncError::Print(_))
        ));
    }
}
