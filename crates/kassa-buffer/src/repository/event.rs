//! # Event Log Repository
//!
//! Append-only audit log of buffer state transitions.
//!
//! ## Purpose
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       buffer_events Table                               │
//! │                                                                         │
//! │  id │ event_type           │ receipt_id │ metadata          │ created  │
//! │  ───┼──────────────────────┼────────────┼───────────────────┼───────── │
//! │  1  │ inserted             │ rcpt-001   │ {"pos_id":"p1"}   │ ...      │
//! │  2  │ sync_started         │ rcpt-001   │ {}                │ ...      │
//! │  3  │ sync_failed          │ rcpt-001   │ {"error":"..."}   │ ...      │
//! │  4  │ circuit_opened       │ NULL       │ {"failures":5}    │ ...      │
//! │                                                                         │
//! │  Written on every state transition. Never mutated or deleted.          │
//! │  Used for forensic replay after an incident, NOT for operational       │
//! │  logic — the daemon never reads this table.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use kassa_core::{BufferEvent, BufferEventKind};

use crate::error::{BufferError, BufferResult};

// =============================================================================
// Transaction Helper
// =============================================================================

/// Appends an event on any executor (pool or open transaction).
///
/// Mutating repository operations call this inside their own transaction
/// so the event commits (or rolls back) atomically with the transition it
/// records.
pub(crate) async fn append_event<'e, E>(
    executor: E,
    kind: BufferEventKind,
    receipt_id: Option<&str>,
    metadata: serde_json::Value,
) -> BufferResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO buffer_events (event_type, receipt_id, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(kind.to_string())
    .bind(receipt_id)
    .bind(metadata.to_string())
    .bind(Utc::now())
    .execute(executor)
    .await?;

    Ok(())
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    event_type: String,
    receipt_id: Option<String>,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> BufferResult<BufferEvent> {
        let event_type: BufferEventKind = self
            .event_type
            .parse()
            .map_err(|e: String| BufferError::Internal(e))?;

        let metadata =
            serde_json::from_str(&self.metadata).unwrap_or(serde_json::Value::Null);

        Ok(BufferEvent {
            id: self.id,
            event_type,
            receipt_id: self.receipt_id,
            metadata,
            created_at: self.created_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the append-only event log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Appends a standalone event (outside any repository transaction).
    ///
    /// Used for events not tied to a single storage transition: daemon
    /// start/stop, circuit open/close.
    pub async fn append(
        &self,
        kind: BufferEventKind,
        receipt_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> BufferResult<()> {
        append_event(&self.pool, kind, receipt_id, metadata).await
    }

    /// Returns the most recent events, newest first.
    pub async fn recent(&self, limit: u32) -> BufferResult<Vec<BufferEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, event_type, receipt_id, metadata, created_at
            FROM buffer_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Returns the full history for one receipt, oldest first.
    ///
    /// This is the forensic replay view: insert, every sync attempt, and
    /// the final outcome.
    pub async fn for_receipt(&self, receipt_id: &str) -> BufferResult<Vec<BufferEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, event_type, receipt_id, metadata, created_at
            FROM buffer_events
            WHERE receipt_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(receipt_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Counts all recorded events.
    pub async fn count(&self) -> BufferResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffer_events")
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

    #[tokio::test]
    async fn test_append_and_read_back() {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let events = buffer.events();

        events
            .append(
                BufferEventKind::DaemonStarted,
                None,
                serde_json::json!({"interval_secs": 10}),
            )
            .await
            .unwrap();
        events
            .append(
                BufferEventKind::SyncFailed,
                Some("rcpt-1"),
                serde_json::json!({"error": "timeout"}),
            )
            .await
            .unwrap();

        let recent = events.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first
        assert_eq!(recent[0].event_type, BufferEventKind::SyncFailed);
        assert_eq!(recent[0].receipt_id.as_deref(), Some("rcpt-1"));

        let history = events.for_receipt("rcpt-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metadata["error"], "timeout");
    }

    #[tokio::test]
    async fn test_event_ids_monotone() {
        let buffer = Buffer::open(BufferConfig::in_memory()).await.unwrap();
        let events = buffer.events();

        for _ in 0..5 {
            events
                .append(BufferEventKind::DaemonStarted, None, serde_json::json!({}))
                .await
                .unwrap();
        }

        let recent = events.recent(10).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ids, sorted);
    }
}
