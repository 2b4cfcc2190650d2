//! # Dead Letter Repository
//!
//! Receipts that exhausted their retry budget against the remote operator.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Dead Letter Lifecycle                             │
//! │                                                                         │
//! │  Sync daemon: retry_count ≥ max_retries                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  [SINGLE TRANSACTION in ReceiptRepository::move_to_dead_letter]        │
//! │  1. DELETE FROM receipts WHERE id = ?                                  │
//! │  2. INSERT INTO dead_letters (...)                                     │
//! │  3. INSERT INTO buffer_events ('moved_to_dead_letter', ...)            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Entry sits here until an operator resolves it manually                │
//! │  (re-submission, export to the operator portal, write-off).            │
//! │  Resolution only stamps resolved_at/resolved_by; the payload is        │
//! │  preserved forever.                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use kassa_core::{DeadLetterEntry, FiscalDocument};

use crate::error::{BufferError, BufferResult};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    receipt_id: String,
    pos_id: String,
    fiscal_document: String,
    final_error: String,
    attempts: i64,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
}

impl DeadLetterRow {
    fn into_entry(self) -> BufferResult<DeadLetterEntry> {
        let fiscal_document: FiscalDocument = serde_json::from_str(&self.fiscal_document)
            .map_err(|e| BufferError::CorruptPayload {
                id: self.receipt_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(DeadLetterEntry {
            id: self.id,
            receipt_id: self.receipt_id,
            pos_id: self.pos_id,
            fiscal_document,
            final_error: self.final_error,
            attempts: self.attempts,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
            resolved_by: self.resolved_by,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for dead-letter entries.
///
/// Entries are *created* by [`ReceiptRepository::move_to_dead_letter`]
/// (same transaction as the receipt removal); this repository only reads
/// and resolves them.
///
/// [`ReceiptRepository::move_to_dead_letter`]: crate::repository::receipt::ReceiptRepository::move_to_dead_letter
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Creates a new DeadLetterRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeadLetterRepository { pool }
    }

    /// Fetches a dead-letter entry by its id.
    pub async fn get(&self, id: &str) -> BufferResult<DeadLetterEntry> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, receipt_id, pos_id, fiscal_document, final_error,
                   attempts, created_at, resolved_at, resolved_by
            FROM dead_letters
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BufferError::not_found("DeadLetterEntry", id))?;

        row.into_entry()
    }

    /// Lists all entries, newest first.
    pub async fn list(&self) -> BufferResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, receipt_id, pos_id, fiscal_document, final_error,
                   attempts, created_at, resolved_at, resolved_by
            FROM dead_letters
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    /// Lists entries that still need operator attention, oldest first.
    pub async fn list_unresolved(&self) -> BufferResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, receipt_id, pos_id, fiscal_document, final_error,
                   attempts, created_at, resolved_at, resolved_by
            FROM dead_letters
            WHERE resolved_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    /// Marks an entry as administratively resolved.
    ///
    /// The payload is preserved; only the resolution stamp is written.
    /// Resolving twice fails with NotFound (the first resolution wins).
    pub async fn resolve(&self, id: &str, operator: &str) -> BufferResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET resolved_at = ?2, resolved_by = ?3
            WHERE id = ?1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BufferError::not_found("DeadLetterEntry", id));
        }

        info!(dead_letter_id = %id, operator = %operator, "Dead letter resolved");
        Ok(())
    }

    /// Counts all dead-letter entries (resolved included — the metric
    /// reports everything that ever exhausted its budget).
    pub async fn count(&self) -> BufferResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Counts entries awaiting resolution.
    pub async fn count_unresolved(&self) -> BufferResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Buffer, BufferConfig};
    use kassa_core::{PaymentKind, PaymentLine, ReceiptItem, ReceiptType};

    async fn seed_entry(buffer: &Buffer, id: &str) {
        let doc = FiscalDocument::from_lines(
            ReceiptType::Sale,
            vec![ReceiptItem {
                name: "Frame".into(),
                unit_price_cents: 1000,
                quantity: 1,
                line_total_cents: 1000,
                tax_rate_bps: None,
            }],
            vec![PaymentLine {
                kind: PaymentKind::Cash,
                amount_cents: 1000,
            }],
        );

        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (id, receipt_id, pos_id, fiscal_document, final_error, attempts, created_at)
            VALUES (?1, ?2, 'pos-01', ?3, 'connection refused', 5, ?4)
            "#,
        )
        .bind(id)
        .bind(format!("rcpt-{id}"))
        .bind(serde_json::to_string(&doc).unwrap())
        .bind(Utc::now())
        .execute(buffer.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        seed_entry(&buffer, "dlq-1").await;

        let repo = buffer.dead_letters();
        assert_eq!(repo.count().await.unwrap(), 1);

        let entry = repo.get("dlq-1").await.unwrap();
        assert_eq!(entry.receipt_id, "rcpt-dlq-1");
        assert_eq!(entry.attempts, 5);
        assert_eq!(entry.fiscal_document.total_cents, 1000);
        assert!(entry.resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        seed_entry(&buffer, "dlq-1").await;

        let repo = buffer.dead_letters();
        repo.resolve("dlq-1", "back-office").await.unwrap();

        let entry = repo.get("dlq-1").await.unwrap();
        assert!(entry.resolved_at.is_some());
        assert_eq!(entry.resolved_by.as_deref(), Some("back-office"));
        assert_eq!(repo.count_unresolved().await.unwrap(), 0);

        // Second resolution fails: first one wins
        assert!(repo.resolve("dlq-1", "someone-else").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let repo = buffer.dead_letters();

        assert!(matches!(
            repo.get("nope").await,
            Err(BufferError::NotFound { .. })
        ));
    }
}
