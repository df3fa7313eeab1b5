//! # Outbox Repository
//!
//! Storage operations for the transactional outbox.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  COMMIT STAGE                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. Upsert calculation_results                                  │   │
//! │  │  2. Upsert calc_audit (+ groups)                                │   │
//! │  │  3. INSERT INTO outbox_events (status = 'PENDING')              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │  COMMIT ← event exists iff the result exists                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  BACKGROUND PUBLISHER (meridian-engine)                         │   │
//! │  │                                                                 │   │
//! │  │  claim_due():  UPDATE ... WHERE id IN (                        │   │
//! │  │    SELECT id FROM outbox_events                                │   │
//! │  │    WHERE status IN ('PENDING','PROCESSING')                    │   │
//! │  │      AND next_retry_at <= NOW()                                │   │
//! │  │    ORDER BY created_at LIMIT $1                                │   │
//! │  │    FOR UPDATE SKIP LOCKED)                                     │   │
//! │  │  SET status = 'PROCESSING'                                     │   │
//! │  │                                                                 │   │
//! │  │  then per row: publish → mark_completed()                      │   │
//! │  │                or        mark_failed() (backoff / DEAD_LETTER) │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ORDERING: claims are ORDER BY created_at and published               │
//! │  sequentially, so events for one aggregate keep insertion order.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;

// =============================================================================
// Status
// =============================================================================

/// Outbox row lifecycle: `PENDING → PROCESSING → COMPLETED`, or
/// `DEAD_LETTER` after exhausting retries. Dead-lettered rows are never
/// claimed again by the normal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::DeadLetter => "DEAD_LETTER",
        }
    }
}

// =============================================================================
// Row
// =============================================================================

/// One outbox row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for outbox operations.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub fn new(pool: PgPool) -> Self {
        OutboxRepository { pool }
    }

    /// Inserts a `PENDING` row. Part of the commit transaction: `conn`
    /// must belong to it, or the delivery guarantee is gone.
    pub async fn enqueue(
        &self,
        conn: &mut PgConnection,
        event_type: &str,
        aggregate_id: &str,
        payload: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> DbResult<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, event_type, aggregate_id, payload, metadata,
                status, retry_count, next_retry_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, NOW(), NOW())
            "#,
        )
        .bind(&id)
        .bind(event_type)
        .bind(aggregate_id)
        .bind(payload)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;

        debug!(id = %id, event_type, aggregate_id, "Enqueued outbox event");
        Ok(id)
    }

    /// Atomically claims up to `limit` due rows and marks them
    /// `PROCESSING`. `FOR UPDATE SKIP LOCKED` lets concurrent claimers
    /// (other processes) pass each other without blocking; rows come
    /// back in `created_at` order.
    pub async fn claim_due(&self, limit: i64) -> DbResult<Vec<OutboxRow>> {
        let mut rows: Vec<OutboxRow> = sqlx::query_as::<_, OutboxRow>(
            r#"
            UPDATE outbox_events SET status = 'PROCESSING'
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE status IN ('PENDING', 'PROCESSING')
                  AND next_retry_at <= NOW()
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_type, aggregate_id, payload, metadata,
                      status, retry_count, next_retry_at, created_at,
                      processed_at, error
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not guarantee order; restore it.
        rows.sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));
        Ok(rows)
    }

    /// Marks a row published.
    pub async fn mark_completed(&self, id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'COMPLETED', processed_at = NOW(), error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a publish failure: bumps the retry count, schedules the
    /// next attempt `backoff_secs` out, and optionally dead-letters.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        backoff_secs: i64,
        dead_letter: bool,
    ) -> DbResult<()> {
        let status = if dead_letter {
            OutboxStatus::DeadLetter
        } else {
            OutboxStatus::Pending
        };

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2,
                retry_count = retry_count + 1,
                next_retry_at = NOW() + make_interval(secs => $3),
                error = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(backoff_secs as f64)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of rows not yet completed or dead-lettered.
    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outbox_events
            WHERE status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
