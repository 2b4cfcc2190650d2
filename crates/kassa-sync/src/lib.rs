//! # Kassa Sync
//!
//! Phase 2 of fiscalization: background synchronization of buffered
//! receipts to the fiscal data operator (OFD).
//!
//! ## Components
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          kassa-sync                                     │
//! │                                                                         │
//! │  ┌──────────────┐    Phase 1     ┌───────────────────────────────┐     │
//! │  │ Orchestrator │ ─────────────► │ kassa-buffer (durable)        │     │
//! │  │ validate,    │                └──────────────┬────────────────┘     │
//! │  │ stamp, print │                               │ Phase 2              │
//! │  └──────────────┘                               ▼                      │
//! │                                  ┌───────────────────────────────┐     │
//! │  ┌──────────────┐   guards       │ SyncDaemon                    │     │
//! │  │CircuitBreaker│ ◄───────────── │ lease ► batch ► submit ►      │     │
//! │  └──────────────┘                │ confirm / retry / dead-letter │     │
//! │  ┌──────────────┐   excludes     └──────────────┬────────────────┘     │
//! │  │  LeaseLock   │ ◄──────────────────────────── │                      │
//! │  └──────────────┘                               ▼                      │
//! │                                  ┌───────────────────────────────┐     │
//! │                                  │ OfdClient (mock | http)       │     │
//! │                                  └───────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod breaker;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod printer;

pub use breaker::{BreakerError, BreakerStats, BreakerTransition, CircuitBreaker, CircuitState};
pub use client::{HttpOfdClient, MockOfdClient, MockResponse, OfdAck, OfdClient};
pub use config::{AdapterConfig, OfdTransport};
pub use daemon::{CycleReport, SyncDaemon, SyncDaemonHandle};
pub use error::{OfdError, SyncError, SyncResult};
pub use lock::{LeaseLock, LocalLeaseLock, RedisLeaseLock};
pub use orchestrator::{BufferStatusReport, FiscalizationOutcome, Orchestrator, Phase2Health};
pub use printer::{PrintDriver, StubPrintDriver};

// =============================================================================
// End-to-End Scenario Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use kassa_buffer::{Buffer, BufferConfig};
    use kassa_core::{
        CreateReceiptRequest, HybridClock, PaymentKind, PaymentLine, ReceiptItem, ReceiptStatus,
        ReceiptType,
    };

    /// Full adapter wiring against the mock operator.
    struct Adapter {
        orchestrator: Orchestrator,
        daemon: SyncDaemon,
        buffer: Buffer,
        client: Arc<MockOfdClient>,
        breaker: Arc<CircuitBreaker>,
    }

    async fn adapter(config: AdapterConfig) -> Adapter {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let clock = Arc::new(HybridClock::new());
        let client = Arc::new(MockOfdClient::new());
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_success_threshold,
            Duration::from_secs(config.breaker_recovery_timeout_secs),
        ));

        let orchestrator = Orchestrator::new(
            buffer.clone(),
            clock.clone(),
            Arc::new(StubPrintDriver::new()),
            breaker.clone(),
            config.pos_id.clone(),
        );

        let (daemon, _handle) = SyncDaemon::new(
            &config,
            buffer.clone(),
            clock,
            client.clone(),
            breaker.clone(),
            Arc::new(LocalLeaseLock::new()),
        );

        Adapter {
            orchestrator,
            daemon,
            buffer,
            client,
            breaker,
        }
    }

    fn sale(key: &str, cents: i64) -> CreateReceiptRequest {
        CreateReceiptRequest {
            pos_id: "pos-01".into(),
            receipt_type: ReceiptType::Sale,
            idempotency_key: key.into(),
            original_receipt_id: None,
            items: vec![ReceiptItem {
                name: "Varifocal lenses".into(),
                unit_price_cents: cents,
                quantity: 1,
                line_total_cents: cents,
                tax_rate_bps: Some(2000),
            }],
            payments: vec![PaymentLine {
                kind: PaymentKind::Card,
                amount_cents: cents,
            }],
        }
    }

    /// Happy path: a sale flows through both phases and ends confirmed.
    #[tokio::test]
    async fn test_online_sale_end_to_end() {
        let adapter = adapter(AdapterConfig::for_tests()).await;

        let outcome = adapter.orchestrator.process(sale("k1", 19900)).await.unwrap();
        assert_eq!(outcome.receipt.status, ReceiptStatus::Pending);
        assert!(outcome.receipt.fiscal_document.document_number.is_some());

        let report = adapter.daemon.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);

        let receipt = adapter
            .orchestrator
            .get_receipt(&outcome.receipt.id)
            .await
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Synced);
        assert!(receipt.synced_at.is_some());

        // Nothing left to drain
        let report = adapter.daemon.run_cycle().await.unwrap();
        assert_eq!(report.attempted, 0);
    }

    /// Offline burst: sales keep completing while the operator is down,
    /// the circuit opens, and everything drains once connectivity returns.
    #[tokio::test]
    async fn test_offline_burst_then_recovery() {
        let mut config = AdapterConfig::for_tests();
        config.breaker_failure_threshold = 1;
        config.breaker_recovery_timeout_secs = 60;
        let adapter = adapter(config).await;

        // Operator down; first attempt trips the breaker immediately
        adapter.client.script(MockResponse::Unreachable);

        // Sales are NOT blocked by the outage, and 50 of them sit well
        // under the buffer ceiling
        for i in 0..50 {
            let outcome = adapter
                .orchestrator
                .process(sale(&format!("k{i}"), 1000 + i))
                .await
                .unwrap();
            assert!(outcome.receipt.fiscal_document.printed_at.is_some());
        }

        let report = adapter.daemon.run_cycle().await.unwrap();
        assert!(report.circuit_interrupted);
        assert_eq!(report.synced, 0);
        assert_eq!(adapter.breaker.state(), CircuitState::Open);

        // While open: cycles are cheap no-ops, no operator calls, receipts
        // keep their retry budgets
        let report = adapter.daemon.run_cycle().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(adapter.client.call_count(), 1);

        let status = adapter.orchestrator.buffer_status().await.unwrap();
        assert_eq!(status.buffer.pending, 50);
        assert_eq!(status.circuit, "open");

        // Connectivity returns after the open window. Pause the clock only
        // for this jump: sqlx pool acquires run under a tokio timeout, and
        // paused-time auto-advance would fire that timeout before the
        // SQLite background thread can respond.
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::time::resume();

        let report = adapter.daemon.run_cycle().await.unwrap();
        assert_eq!(report.synced, 50);
        assert_eq!(adapter.breaker.state(), CircuitState::Closed);

        let status = adapter.orchestrator.buffer_status().await.unwrap();
        assert_eq!(status.buffer.pending, 0);
        assert_eq!(status.buffer.synced, 50);
        assert_eq!(status.buffer.dead_letters, 0);

        // The operator saw the tripping call plus exactly one successful
        // submission per receipt: nothing was registered twice
        let submitted = adapter.client.submitted();
        assert_eq!(submitted.len(), 51);
        let unique: std::collections::HashSet<_> = submitted.iter().collect();
        assert_eq!(unique.len(), 50);
    }

    /// A document the operator permanently rejects lands in the dead-letter
    /// queue without blocking the receipts behind it, and an operator can
    /// resolve it.
    #[tokio::test]
    async fn test_rejection_quarantined_and_resolved() {
        let adapter = adapter(AdapterConfig::for_tests()).await;

        let bad = adapter.orchestrator.process(sale("bad", 100)).await.unwrap();
        adapter.orchestrator.process(sale("good", 200)).await.unwrap();

        adapter
            .client
            .script(MockResponse::Rejected(422, "unsupported tax code".into()));

        let report = adapter.daemon.run_cycle().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.synced, 1);

        // The rejected receipt is quarantined with its payload intact
        let dead_letters = adapter.buffer.dead_letters();
        let entries = dead_letters.list_unresolved().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].receipt_id, bad.receipt.id);
        assert_eq!(entries[0].fiscal_document.total_cents, 100);

        dead_letters
            .resolve(&entries[0].id, "back-office")
            .await
            .unwrap();
        assert_eq!(dead_letters.count_unresolved().await.unwrap(), 0);

        // Buffer capacity was freed by the quarantine
        let status = adapter.orchestrator.buffer_status().await.unwrap();
        assert_eq!(status.buffer.active, 0);
        assert_eq!(status.buffer.dead_letters, 1);
    }

    /// Receipts confirmed with operator time order ahead of everything the
    /// operator has already seen, even on a skewed terminal.
    #[tokio::test]
    async fn test_server_time_propagates_to_later_receipts() {
        let adapter = adapter(AdapterConfig::for_tests()).await;

        let first = adapter.orchestrator.process(sale("k1", 100)).await.unwrap();

        let server_time = chrono::Utc::now().timestamp() + 5_000;
        adapter.client.script(MockResponse::Ack {
            document_number: "fd-1".into(),
            server_time,
        });
        adapter.daemon.run_cycle().await.unwrap();

        // A receipt created after the confirmation orders after it
        let second = adapter.orchestrator.process(sale("k2", 100)).await.unwrap();
        assert!(second.receipt.order_key.local_time >= server_time);
        assert!(second.receipt.order_key > first.receipt.order_key);
    }
}
