//! # Receipt Repository
//!
//! The active receipt buffer: bounded, idempotent, crash-consistent.
//!
//! ## Write Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Every Mutation Is One Transaction                       │
//! │                                                                         │
//! │  insert(receipt)                                                       │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. SELECT by idempotency_key  → hit? return existing, no dup  │   │
//! │  │  2. COUNT active receipts      → at ceiling? CapacityExceeded  │   │
//! │  │  3. INSERT INTO receipts (...)                                 │   │
//! │  │  4. INSERT INTO buffer_events ('inserted', ...)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← WAL append + fsync. Once the caller sees Ok, the receipt     │
//! │           survives power loss.                                         │
//! │                                                                         │
//! │  Status transitions carry the same discipline: the row update and      │
//! │  its audit event commit together or not at all.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarded Transitions
//! Every UPDATE carries `AND status = '<expected>'` and checks
//! `rows_affected`, so a racing writer (e.g. two daemon instances during a
//! lock failover) loses cleanly with [`BufferError::IllegalTransition`]
//! instead of corrupting the state machine.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use kassa_core::{
    BufferEventKind, DeadLetterEntry, FiscalDocument, HlcTimestamp, Receipt, ReceiptStatus,
    ReceiptType,
};

use crate::error::{BufferError, BufferResult};
use crate::repository::event::append_event;

// =============================================================================
// Input / Output Types
// =============================================================================

/// Fields the orchestrator supplies for a new receipt. The repository
/// generates the id and timestamps.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub pos_id: String,
    pub receipt_type: ReceiptType,
    pub idempotency_key: String,
    pub original_receipt_id: Option<String>,
    /// Assigned by the hybrid clock before the insert; immutable afterwards.
    pub order_key: HlcTimestamp,
    pub fiscal_document: FiscalDocument,
}

/// Result of an insert attempt.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub receipt: Receipt,
    /// True when the idempotency key matched an existing receipt and no
    /// new row was written.
    pub deduplicated: bool,
}

/// Per-status receipt counts for the status aggregation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounts {
    pub pending: u32,
    pub syncing: u32,
    pub synced: u32,
    pub failed: u32,
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    id: String,
    pos_id: String,
    receipt_type: ReceiptType,
    idempotency_key: String,
    original_receipt_id: Option<String>,
    status: ReceiptStatus,
    local_time: i64,
    logical_counter: i64,
    server_time: Option<i64>,
    fiscal_document: String,
    retry_count: i64,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
}

const RECEIPT_COLUMNS: &str = r#"
    id, pos_id, receipt_type, idempotency_key, original_receipt_id, status,
    local_time, logical_counter, server_time, fiscal_document,
    retry_count, last_error, next_attempt_at, created_at, updated_at, synced_at
"#;

impl ReceiptRow {
    fn into_receipt(self) -> BufferResult<Receipt> {
        let fiscal_document: FiscalDocument = serde_json::from_str(&self.fiscal_document)
            .map_err(|e| BufferError::CorruptPayload {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Receipt {
            id: self.id,
            pos_id: self.pos_id,
            receipt_type: self.receipt_type,
            idempotency_key: self.idempotency_key,
            original_receipt_id: self.original_receipt_id,
            status: self.status,
            order_key: HlcTimestamp {
                local_time: self.local_time,
                logical_counter: self.logical_counter,
                server_time: self.server_time,
            },
            fiscal_document,
            retry_count: self.retry_count,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            synced_at: self.synced_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for active receipt operations.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
    /// Active-receipt ceiling enforced by inserts.
    capacity: u32,
}

impl ReceiptRepository {
    /// Creates a new ReceiptRepository.
    pub fn new(pool: SqlitePool, capacity: u32) -> Self {
        ReceiptRepository { pool, capacity }
    }

    // -------------------------------------------------------------------------
    // Insert
    // -------------------------------------------------------------------------

    /// Inserts a receipt, enforcing capacity and idempotency.
    ///
    /// ## Behavior
    /// - An existing receipt with the same `idempotency_key` is returned
    ///   unchanged (`deduplicated = true`) — a caller retry after a crash
    ///   before acknowledgment must not create a duplicate
    /// - At the active-receipt ceiling the insert fails with
    ///   [`BufferError::CapacityExceeded`] (backpressure, not transient)
    /// - The row and its `inserted` audit event commit atomically
    pub async fn insert(&self, new: NewReceipt) -> BufferResult<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        // Idempotency: a retried submission returns the original receipt
        let existing = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE idempotency_key = ?1"
        ))
        .bind(&new.idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            debug!(
                idempotency_key = %new.idempotency_key,
                receipt_id = %row.id,
                "Deduplicated receipt submission"
            );
            return Ok(InsertOutcome {
                receipt: row.into_receipt()?,
                deduplicated: true,
            });
        }

        // Capacity: only non-terminal receipts occupy the buffer
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM receipts WHERE status IN ('pending', 'syncing')",
        )
        .fetch_one(&mut *tx)
        .await?;

        if active as u32 >= self.capacity {
            return Err(BufferError::CapacityExceeded {
                active: active as u32,
                capacity: self.capacity,
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let document_json =
            serde_json::to_string(&new.fiscal_document).map_err(|e| BufferError::CorruptPayload {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            r#"
            INSERT INTO receipts (
                id, pos_id, receipt_type, idempotency_key, original_receipt_id,
                status, local_time, logical_counter, server_time, fiscal_document,
                retry_count, last_error, next_attempt_at, created_at, updated_at, synced_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                'pending', ?6, ?7, ?8, ?9,
                0, NULL, NULL, ?10, ?10, NULL
            )
            "#,
        )
        .bind(&id)
        .bind(&new.pos_id)
        .bind(new.receipt_type)
        .bind(&new.idempotency_key)
        .bind(&new.original_receipt_id)
        .bind(new.order_key.local_time)
        .bind(new.order_key.logical_counter)
        .bind(new.order_key.server_time)
        .bind(&document_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        append_event(
            &mut *tx,
            BufferEventKind::Inserted,
            Some(&id),
            serde_json::json!({
                "pos_id": new.pos_id,
                "receipt_type": new.receipt_type.to_string(),
                "order_key": new.order_key.to_string(),
            }),
        )
        .await?;

        tx.commit().await?;

        debug!(receipt_id = %id, pos_id = %new.pos_id, "Receipt buffered");

        Ok(InsertOutcome {
            receipt: Receipt {
                id,
                pos_id: new.pos_id,
                receipt_type: new.receipt_type,
                idempotency_key: new.idempotency_key,
                original_receipt_id: new.original_receipt_id,
                status: ReceiptStatus::Pending,
                order_key: new.order_key,
                fiscal_document: new.fiscal_document,
                retry_count: 0,
                last_error: None,
                next_attempt_at: None,
                created_at: now,
                updated_at: now,
                synced_at: None,
            },
            deduplicated: false,
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetches a receipt by id.
    pub async fn get(&self, id: &str) -> BufferResult<Receipt> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BufferError::not_found("Receipt", id))?;

        row.into_receipt()
    }

    /// Fetches a receipt by its idempotency key, if present.
    pub async fn get_by_idempotency_key(&self, key: &str) -> BufferResult<Option<Receipt>> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE idempotency_key = ?1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReceiptRow::into_receipt).transpose()
    }

    /// Fetches up to `limit` pending receipts whose backoff deadline has
    /// passed, in total hybrid-clock order (oldest causal first).
    ///
    /// This is the sync daemon's batch query; both predicates are indexed.
    pub async fn fetch_due_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BufferResult<Vec<Receipt>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS}
            FROM receipts
            WHERE status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
            ORDER BY COALESCE(server_time, local_time) ASC, logical_counter ASC
            LIMIT ?2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    /// Counts receipts that occupy buffer capacity (pending/syncing).
    pub async fn count_active(&self) -> BufferResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM receipts WHERE status IN ('pending', 'syncing')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Aggregates receipt counts per status.
    pub async fn status_counts(&self) -> BufferResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM receipts GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count as u32,
                "syncing" => counts.syncing = count as u32,
                "synced" => counts.synced = count as u32,
                "failed" => counts.failed = count as u32,
                other => {
                    return Err(BufferError::Internal(format!(
                        "unknown receipt status in store: {other}"
                    )))
                }
            }
        }

        Ok(counts)
    }

    // -------------------------------------------------------------------------
    // Phase 1 Support
    // -------------------------------------------------------------------------

    /// Replaces the stored fiscal document (print driver filled in the
    /// document number during Phase 1). The order key is untouched.
    pub async fn update_document(&self, id: &str, document: &FiscalDocument) -> BufferResult<()> {
        let document_json =
            serde_json::to_string(document).map_err(|e| BufferError::CorruptPayload {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let result = sqlx::query(
            "UPDATE receipts SET fiscal_document = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(&document_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::not_found("Receipt", id));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // State Machine
    // -------------------------------------------------------------------------

    /// `pending → syncing`: a sync attempt begins.
    pub async fn mark_syncing(&self, id: &str) -> BufferResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE receipts SET status = 'syncing', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::IllegalTransition {
                id: id.to_string(),
                to: ReceiptStatus::Syncing,
            });
        }

        append_event(
            &mut *tx,
            BufferEventKind::SyncStarted,
            Some(id),
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// `syncing → synced`: the remote operator accepted the receipt.
    pub async fn mark_synced(
        &self,
        id: &str,
        remote_document_number: Option<&str>,
    ) -> BufferResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE receipts SET status = 'synced', synced_at = ?2, updated_at = ?2, \
             last_error = NULL, next_attempt_at = NULL \
             WHERE id = ?1 AND status = 'syncing'",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::IllegalTransition {
                id: id.to_string(),
                to: ReceiptStatus::Synced,
            });
        }

        append_event(
            &mut *tx,
            BufferEventKind::SyncSucceeded,
            Some(id),
            serde_json::json!({ "remote_document_number": remote_document_number }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// `syncing → pending` after a failed remote attempt: increments the
    /// retry count, records the error, and schedules the next attempt.
    ///
    /// Returns the new retry count so the daemon can decide on dead-letter
    /// promotion.
    pub async fn mark_sync_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> BufferResult<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE receipts SET status = 'pending', retry_count = retry_count + 1, \
             last_error = ?2, next_attempt_at = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = 'syncing'",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::IllegalTransition {
                id: id.to_string(),
                to: ReceiptStatus::Pending,
            });
        }

        let retry_count: i64 =
            sqlx::query_scalar("SELECT retry_count FROM receipts WHERE id = ?1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

        append_event(
            &mut *tx,
            BufferEventKind::SyncFailed,
            Some(id),
            serde_json::json!({
                "error": error,
                "retry_count": retry_count,
                "next_attempt_at": next_attempt_at.to_rfc3339(),
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(retry_count)
    }

    /// `syncing → pending` without a retry penalty.
    ///
    /// Used when the circuit opened: the outage is already accounted for
    /// by the guard, so the receipt keeps its retry budget and its current
    /// backoff deadline.
    pub async fn release_syncing(&self, id: &str, reason: &str) -> BufferResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE receipts SET status = 'pending', updated_at = ?2 \
             WHERE id = ?1 AND status = 'syncing'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::IllegalTransition {
                id: id.to_string(),
                to: ReceiptStatus::Pending,
            });
        }

        append_event(
            &mut *tx,
            BufferEventKind::SyncFailed,
            Some(id),
            serde_json::json!({ "reason": reason, "retry_penalty": false }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Atomically removes an exhausted receipt from the active table and
    /// creates its dead-letter entry.
    ///
    /// The delete, the dead-letter insert, and the audit event are one
    /// transaction: there is no window where the receipt exists in both
    /// tables or in neither.
    pub async fn move_to_dead_letter(
        &self,
        id: &str,
        final_error: &str,
    ) -> BufferResult<DeadLetterEntry> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BufferError::not_found("Receipt", id))?;

        let receipt = row.into_receipt()?;

        sqlx::query("DELETE FROM receipts WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            receipt_id: receipt.id.clone(),
            pos_id: receipt.pos_id.clone(),
            fiscal_document: receipt.fiscal_document.clone(),
            final_error: final_error.to_string(),
            attempts: receipt.retry_count,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };

        let document_json = serde_json::to_string(&entry.fiscal_document).map_err(|e| {
            BufferError::CorruptPayload {
                id: entry.receipt_id.clone(),
                reason: e.to_string(),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (id, receipt_id, pos_id, fiscal_document, final_error, attempts, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.receipt_id)
        .bind(&entry.pos_id)
        .bind(&document_json)
        .bind(&entry.final_error)
        .bind(entry.attempts)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        append_event(
            &mut *tx,
            BufferEventKind::MovedToDeadLetter,
            Some(id),
            serde_json::json!({
                "attempts": entry.attempts,
                "final_error": final_error,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    // -------------------------------------------------------------------------
    // Startup Recovery
    // -------------------------------------------------------------------------

    /// Reverts receipts stranded in `syncing` by a crash mid-cycle back to
    /// `pending`, without a retry penalty (the attempt outcome is unknown;
    /// OFD submission is idempotent by receipt id on the operator side).
    ///
    /// Returns the number of recovered receipts. Call once at startup,
    /// before the daemon begins.
    pub async fn recover_stranded(&self) -> BufferResult<u64> {
        let result = sqlx::query(
            "UPDATE receipts SET status = 'pending', updated_at = ?1 WHERE status = 'syncing'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
