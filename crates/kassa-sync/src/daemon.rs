//! # Sync Daemon
//!
//! Background drain of the receipt buffer toward the fiscal data operator.
//!
//! ## Cycle Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Sync Cycle                                  │
//! │                                                                         │
//! │  tick / manual trigger                                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  1. try_acquire lease ──── held elsewhere? ──► skip cycle              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. fetch due batch (pending, backoff elapsed, hybrid-clock order)     │
//! │       │                                                                 │
//! │       ▼  for each receipt, in order                                     │
//! │  3. circuit open? ───────── yes ──► abort cycle, receipts untouched    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  4. mark syncing ─► breaker.call(submit to OFD)                        │
//! │       │                                                                 │
//! │       ├── ack          → advance clock, mark synced                    │
//! │       ├── rejected 4xx → dead-letter immediately (retry can't help)    │
//! │       ├── transient    → retry++ with exponential backoff;             │
//! │       │                  budget exhausted → dead-letter                │
//! │       └── breaker trips→ release to pending (NO retry consumed),       │
//! │                          abort rest of cycle                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  5. release lease, publish CycleReport                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use kassa_buffer::Buffer;
use kassa_core::{BufferEventKind, HlcTimestamp, HybridClock, Receipt};

use crate::breaker::{BreakerError, CircuitBreaker, CircuitState};
use crate::client::{OfdAck, OfdClient};
use crate::config::AdapterConfig;
use crate::error::{OfdError, SyncResult};
use crate::lock::LeaseLock;

/// What one guarded submission produced. An operator rejection is a
/// *reachability* success: the remote answered, so it must not feed the
/// breaker's failure streak even though the receipt itself is doomed.
enum SubmitVerdict {
    Ack(OfdAck),
    Rejected { status: u16, message: String },
}

// =============================================================================
// Cycle Report
// =============================================================================

/// Outcome of one sync cycle, published on a watch channel for the HTTP
/// surface and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// When the cycle ran.
    pub finished_at: Option<DateTime<Utc>>,

    /// Receipts picked up from the buffer.
    pub attempted: u32,

    /// Receipts confirmed by the operator.
    pub synced: u32,

    /// Receipts returned to pending with a retry consumed.
    pub failed: u32,

    /// Receipts promoted to the dead-letter queue.
    pub dead_lettered: u32,

    /// True when the lease was held elsewhere and the cycle did nothing.
    pub skipped: bool,

    /// True when the circuit opened (or was open) and cut the cycle short.
    pub circuit_interrupted: bool,
}

// =============================================================================
// Daemon Handle
// =============================================================================

/// Handle for controlling a running daemon from outside.
#[derive(Clone)]
pub struct SyncDaemonHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    report_rx: watch::Receiver<CycleReport>,
}

impl SyncDaemonHandle {
    /// Requests an immediate sync cycle (coalesced if one is queued).
    pub fn trigger(&self) {
        // try_send: a queued trigger already guarantees a prompt cycle
        let _ = self.trigger_tx.try_send(());
    }

    /// Signals the daemon to shut down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Last published cycle report.
    pub fn last_report(&self) -> CycleReport {
        self.report_rx.borrow().clone()
    }

    /// Waits until the next cycle report is published.
    pub async fn next_report(&mut self) -> CycleReport {
        let _ = self.report_rx.changed().await;
        self.report_rx.borrow().clone()
    }
}

// =============================================================================
// Sync Daemon
// =============================================================================

/// Background receipt synchronizer.
pub struct SyncDaemon {
    buffer: Buffer,
    clock: Arc<HybridClock>,
    client: Arc<dyn OfdClient>,
    breaker: Arc<CircuitBreaker>,
    lock: Arc<dyn LeaseLock>,

    interval: Duration,
    batch_size: u32,
    max_retries: i64,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,

    report_tx: watch::Sender<CycleReport>,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl SyncDaemon {
    /// Creates a daemon and its control handle.
    pub fn new(
        config: &AdapterConfig,
        buffer: Buffer,
        clock: Arc<HybridClock>,
        client: Arc<dyn OfdClient>,
        breaker: Arc<CircuitBreaker>,
        lock: Arc<dyn LeaseLock>,
    ) -> (Self, SyncDaemonHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (report_tx, report_rx) = watch::channel(CycleReport::default());

        let daemon = SyncDaemon {
            buffer,
            clock,
            client,
            breaker,
            lock,
            interval: config.sync_interval(),
            batch_size: config.sync_batch_size,
            max_retries: config.sync_max_retries,
            backoff_base_secs: config.backoff_base_secs,
            backoff_cap_secs: config.backoff_cap_secs,
            report_tx,
            trigger_rx,
            shutdown_rx,
        };

        let handle = SyncDaemonHandle {
            trigger_tx,
            shutdown_tx,
            report_rx,
        };

        (daemon, handle)
    }

    /// Runs the daemon loop. Spawn as a background task.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Sync daemon starting"
        );

        let _ = self
            .buffer
            .events()
            .append(
                BufferEventKind::DaemonStarted,
                None,
                serde_json::json!({ "interval_secs": self.interval.as_secs() }),
            )
            .await;

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_and_publish().await;
                }

                Some(()) = self.trigger_rx.recv() => {
                    debug!("Manual sync trigger");
                    self.run_and_publish().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync daemon shutting down");
                    break;
                }
            }
        }

        let _ = self
            .buffer
            .events()
            .append(BufferEventKind::DaemonStopped, None, serde_json::json!({}))
            .await;

        info!("Sync daemon stopped");
    }

    async fn run_and_publish(&self) {
        match self.run_cycle().await {
            Ok(report) => {
                let _ = self.report_tx.send(report);
            }
            Err(e) => {
                error!(error = %e, "Sync cycle failed");
            }
        }
    }

    /// Executes one full sync cycle.
    ///
    /// Public so tests (and the manual-trigger path) can drive cycles
    /// deterministically without the timer.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let mut report = CycleReport {
            finished_at: Some(Utc::now()),
            ..Default::default()
        };

        let Some(lease_token) = self.lock.try_acquire().await else {
            debug!("Sync lease unavailable, skipping cycle");
            report.skipped = true;
            return Ok(report);
        };

        let outcome = self.drain_batch(&mut report).await;

        // Always release the lease, even when the drain errored
        if let Err(e) = self.lock.release(&lease_token).await {
            warn!(error = %e, "Lease release failed (will expire by TTL)");
        }

        report.finished_at = Some(Utc::now());
        outcome.map(|_| report)
    }

    async fn drain_batch(&self, report: &mut CycleReport) -> SyncResult<()> {
        let batch = self
            .buffer
            .receipts()
            .fetch_due_batch(self.batch_size, Utc::now())
            .await?;

        if batch.is_empty() {
            debug!("No receipts due for sync");
            return Ok(());
        }

        info!(count = batch.len(), "Draining receipt batch");

        for receipt in batch {
            // Fail fast while the open window is still running; receipts
            // stay pending with their retry budgets intact. A peek, not a
            // check: it must not consume the half-open trial slot.
            let stats = self.breaker.stats();
            if stats.state == CircuitState::Open && stats.retry_in_secs.unwrap_or(0) > 0 {
                debug!(
                    remaining_secs = stats.retry_in_secs.unwrap_or(0),
                    "Circuit open, ending cycle early"
                );
                report.circuit_interrupted = true;
                break;
            }

            report.attempted += 1;

            if self.sync_one(&receipt, report).await {
                // Breaker tripped mid-batch: stop submitting
                report.circuit_interrupted = true;
                break;
            }
        }

        Ok(())
    }

    /// Synchronizes one receipt. Returns true when the circuit opened and
    /// the cycle must end.
    async fn sync_one(&self, receipt: &Receipt, report: &mut CycleReport) -> bool {
        let receipts = self.buffer.receipts();

        if let Err(e) = receipts.mark_syncing(&receipt.id).await {
            // A concurrent actor already moved this receipt on; not ours
            warn!(receipt_id = %receipt.id, error = %e, "Receipt no longer pending, skipping");
            return false;
        }

        let state_before = self.breaker.state();

        let result = self
            .breaker
            .call(async {
                match self.client.submit(receipt).await {
                    Ok(ack) => Ok(SubmitVerdict::Ack(ack)),
                    Err(OfdError::Rejected { status, message }) => {
                        Ok(SubmitVerdict::Rejected { status, message })
                    }
                    Err(transport) => Err(transport),
                }
            })
            .await;

        match result {
            Ok(SubmitVerdict::Ack(ack)) => {
                // The operator's clock now dominates: advance ours so every
                // future receipt orders after everything it has seen
                self.clock
                    .advance(&HlcTimestamp::new(ack.server_time, 0));

                if let Err(e) = receipts
                    .mark_synced(&receipt.id, Some(&ack.document_number))
                    .await
                {
                    error!(receipt_id = %receipt.id, error = %e, "Failed to record sync success");
                    return false;
                }

                // The half-open transition happens inside the guarded call,
                // so "anything but closed before, closed now" is the signal
                if state_before != CircuitState::Closed
                    && self.breaker.state() == CircuitState::Closed
                {
                    let _ = self
                        .buffer
                        .events()
                        .append(BufferEventKind::CircuitClosed, None, serde_json::json!({}))
                        .await;
                }

                debug!(
                    receipt_id = %receipt.id,
                    document_number = %ack.document_number,
                    "Receipt synced"
                );
                report.synced += 1;
                false
            }

            Ok(SubmitVerdict::Rejected { status, message }) => {
                // The operator is reachable and said no. Retrying the same
                // payload cannot succeed: straight to the dead letters.
                let final_error = format!("rejected ({status}): {message}");
                warn!(receipt_id = %receipt.id, error = %final_error, "Receipt rejected by OFD");

                match receipts.move_to_dead_letter(&receipt.id, &final_error).await {
                    Ok(_) => report.dead_lettered += 1,
                    Err(e) => {
                        error!(receipt_id = %receipt.id, error = %e, "Dead-letter promotion failed")
                    }
                }
                false
            }

            Err(BreakerError::Open { retry_in_secs }) => {
                // Lost the race for the trial slot (or the circuit opened
                // under us). The receipt keeps its retry budget.
                debug!(receipt_id = %receipt.id, retry_in_secs, "Circuit refused the call");
                if let Err(e) = receipts.release_syncing(&receipt.id, "circuit_open").await {
                    error!(receipt_id = %receipt.id, error = %e, "Release after circuit refusal failed");
                }
                true
            }

            Err(BreakerError::Inner(transient)) => {
                if self.breaker.state() == CircuitState::Open {
                    // This failure tripped (or re-tripped) the circuit
                    let _ = self
                        .buffer
                        .events()
                        .append(
                            BufferEventKind::CircuitOpened,
                            None,
                            serde_json::json!({ "trigger": transient.to_string() }),
                        )
                        .await;

                    // The outage is the breaker's problem now. The receipt
                    // keeps its retry budget and goes back to pending.
                    if let Err(e) = receipts.release_syncing(&receipt.id, "circuit_open").await {
                        error!(receipt_id = %receipt.id, error = %e, "Release after circuit open failed");
                    }
                    return true;
                }

                self.handle_transient_failure(receipt, &transient.to_string(), report)
                    .await;
                false
            }
        }
    }

    async fn handle_transient_failure(
        &self,
        receipt: &Receipt,
        error: &str,
        report: &mut CycleReport,
    ) {
        let receipts = self.buffer.receipts();
        let next_attempt_at = Utc::now() + ChronoDuration::seconds(self.backoff_secs(receipt.retry_count) as i64);

        match receipts
            .mark_sync_failed(&receipt.id, error, next_attempt_at)
            .await
        {
            Ok(retry_count) if retry_count >= self.max_retries => {
                warn!(
                    receipt_id = %receipt.id,
                    retry_count,
                    "Retry budget exhausted, promoting to dead letters"
                );

                match receipts.move_to_dead_letter(&receipt.id, error).await {
                    Ok(_) => report.dead_lettered += 1,
                    Err(e) => {
                        error!(receipt_id = %receipt.id, error = %e, "Dead-letter promotion failed")
                    }
                }
            }

            Ok(retry_count) => {
                debug!(
                    receipt_id = %receipt.id,
                    retry_count,
                    next_attempt_at = %next_attempt_at,
                    "Sync attempt failed, scheduled retry"
                );
                report.failed += 1;
            }

            Err(e) => {
                error!(receipt_id = %receipt.id, error = %e, "Failed to record sync failure");
            }
        }
    }

    /// Exponential backoff: `min(cap, base * 2^retries)` seconds.
    fn backoff_secs(&self, retries: i64) -> u64 {
        let exponent = retries.clamp(0, 32) as u32;
        self.backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_secs)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockOfdClient, MockResponse};
    use crate::lock::LocalLeaseLock;
    use kassa_buffer::{BufferConfig, NewReceipt};
    use kassa_core::{
        FiscalDocument, PaymentKind, PaymentLine, ReceiptItem, ReceiptStatus, ReceiptType,
    };

    struct Fixture {
        daemon: SyncDaemon,
        buffer: Buffer,
        client: Arc<MockOfdClient>,
        clock: Arc<HybridClock>,
        breaker: Arc<CircuitBreaker>,
    }

    async fn fixture(config: AdapterConfig) -> Fixture {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let clock = Arc::new(HybridClock::new());
        let client = Arc::new(MockOfdClient::new());
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_success_threshold,
            Duration::from_secs(config.breaker_recovery_timeout_secs),
        ));
        let lock: Arc<dyn LeaseLock> = Arc::new(LocalLeaseLock::new());

        let (daemon, _handle) = SyncDaemon::new(
            &config,
            buffer.clone(),
            clock.clone(),
            client.clone(),
            breaker.clone(),
            lock,
        );

        Fixture {
            daemon,
            buffer,
            client,
            clock,
            breaker,
        }
    }

    async fn buffer_receipt(fx: &Fixture, key: &str) -> String {
        let document = FiscalDocument::from_lines(
            ReceiptType::Sale,
            vec![ReceiptItem {
                name: "Sunglasses".into(),
                unit_price_cents: 8900,
                quantity: 1,
                line_total_cents: 8900,
                tax_rate_bps: Some(2000),
            }],
            vec![PaymentLine {
                kind: PaymentKind::Card,
                amount_cents: 8900,
            }],
        );

        fx.buffer
            .receipts()
            .insert(NewReceipt {
                pos_id: "pos-01".into(),
                receipt_type: ReceiptType::Sale,
                idempotency_key: key.into(),
                original_receipt_id: None,
                order_key: fx.clock.generate(),
                fiscal_document: document,
            })
            .await
            .unwrap()
            .receipt
            .id
    }

    #[tokio::test]
    async fn test_cycle_drains_in_order() {
        let fx = fixture(AdapterConfig::for_tests()).await;
        let a = buffer_receipt(&fx, "a").await;
        let b = buffer_receipt(&fx, "b").await;

        let report = fx.daemon.run_cycle().await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 0);

        // Submitted in hybrid-clock (insertion) order
        assert_eq!(fx.client.submitted(), vec![a.clone(), b.clone()]);

        assert_eq!(
            fx.buffer.receipts().get(&a).await.unwrap().status,
            ReceiptStatus::Synced
        );
        assert_eq!(
            fx.buffer.receipts().get(&b).await.unwrap().status,
            ReceiptStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let fx = fixture(AdapterConfig::for_tests()).await;
        let id = buffer_receipt(&fx, "a").await;

        fx.client.script(MockResponse::Unreachable);

        let report = fx.daemon.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 0);

        let receipt = fx.buffer.receipts().get(&id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
        assert_eq!(receipt.retry_count, 1);
        assert!(receipt.next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_rejection_dead_letters_immediately() {
        let fx = fixture(AdapterConfig::for_tests()).await;
        let id = buffer_receipt(&fx, "a").await;

        fx.client
            .script(MockResponse::Rejected(422, "unknown tax code".into()));

        let report = fx.daemon.run_cycle().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        // Removed from the active buffer on the first attempt
        assert!(fx.buffer.receipts().get(&id).await.is_err());
        let entries = fx.buffer.dead_letters().list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].final_error.contains("422"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_promotes_to_dlq() {
        let mut config = AdapterConfig::for_tests();
        config.sync_max_retries = 2;
        // High threshold so the breaker stays out of this test
        config.breaker_failure_threshold = 100;
        let fx = fixture(config).await;
        let id = buffer_receipt(&fx, "a").await;

        fx.client.script_failures(2);

        // First failure: retry scheduled
        fx.daemon.run_cycle().await.unwrap();
        // Force the backoff deadline into the past so the next cycle picks it up
        sqlx::query("UPDATE receipts SET next_attempt_at = datetime('now', '-1 hour')")
            .execute(fx.buffer.pool())
            .await
            .unwrap();

        // Second failure: budget (2) hit, promoted
        let report = fx.daemon.run_cycle().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        assert!(fx.buffer.receipts().get(&id).await.is_err());
        let entry = &fx.buffer.dead_letters().list().await.unwrap()[0];
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn test_circuit_open_aborts_cycle_without_penalty() {
        let mut config = AdapterConfig::for_tests();
        config.breaker_failure_threshold = 1;
        let fx = fixture(config).await;
        let a = buffer_receipt(&fx, "a").await;
        let b = buffer_receipt(&fx, "b").await;

        fx.client.script(MockResponse::Unreachable);

        let report = fx.daemon.run_cycle().await.unwrap();
        assert!(report.circuit_interrupted);
        assert_eq!(report.attempted, 1);

        // First receipt back to pending with NO retry consumed
        let first = fx.buffer.receipts().get(&a).await.unwrap();
        assert_eq!(first.status, ReceiptStatus::Pending);
        assert_eq!(first.retry_count, 0);

        // Second receipt never reached the operator
        assert_eq!(fx.client.call_count(), 1);
        assert_eq!(
            fx.buffer.receipts().get(&b).await.unwrap().status,
            ReceiptStatus::Pending
        );

        // While open, the next cycle submits nothing at all
        let report = fx.daemon.run_cycle().await.unwrap();
        assert!(report.circuit_interrupted);
        assert_eq!(report.attempted, 0);
        assert_eq!(fx.client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ack_advances_clock() {
        let fx = fixture(AdapterConfig::for_tests()).await;
        buffer_receipt(&fx, "a").await;

        let far_future = Utc::now().timestamp() + 10_000;
        fx.client.script(MockResponse::Ack {
            document_number: "fd-1".into(),
            server_time: far_future,
        });

        fx.daemon.run_cycle().await.unwrap();

        // Every receipt created after the ack orders after the server time
        let next = fx.clock.generate();
        assert!(next.local_time >= far_future);
    }

    #[tokio::test]
    async fn test_backoff_growth_is_capped() {
        let mut config = AdapterConfig::for_tests();
        config.backoff_base_secs = 1;
        config.backoff_cap_secs = 300;
        let fx = fixture(config).await;

        assert_eq!(fx.daemon.backoff_secs(0), 1);
        assert_eq!(fx.daemon.backoff_secs(1), 2);
        assert_eq!(fx.daemon.backoff_secs(4), 16);
        assert_eq!(fx.daemon.backoff_secs(8), 256);
        // Capped from here on
        assert_eq!(fx.daemon.backoff_secs(9), 300);
        assert_eq!(fx.daemon.backoff_secs(60), 300);
    }

    #[tokio::test]
    async fn test_breaker_state_shared_across_cycles() {
        let mut config = AdapterConfig::for_tests();
        config.breaker_failure_threshold = 1;
        let fx = fixture(config).await;
        buffer_receipt(&fx, "a").await;

        fx.client.script(MockResponse::Unreachable);
        fx.daemon.run_cycle().await.unwrap();

        assert_eq!(fx.breaker.state(), crate::breaker::CircuitState::Open);
    }
}
