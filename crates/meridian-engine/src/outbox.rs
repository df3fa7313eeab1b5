//! # Outbox Publisher
//!
//! Background loop that drains the outbox table to the broker.
//!
//! ## Publisher Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Outbox Publisher Flow                               │
//! │                                                                         │
//! │  1. Tick: every poll interval (default 5 s)                            │
//! │                                                                         │
//! │  2. Claim: up to 100 PENDING|PROCESSING rows whose next_retry_at       │
//! │     is due, ORDER BY created_at, FOR UPDATE SKIP LOCKED                │
//! │     (rows flip to PROCESSING atomically with the claim)                │
//! │                                                                         │
//! │  3. Publish: sequentially, one row at a time - per-aggregate           │
//! │     insertion order survives all the way to the broker                 │
//! │                                                                         │
//! │  4. Success: status = COMPLETED, processed_at = NOW()                  │
//! │                                                                         │
//! │  5. Failure: retry_count += 1,                                         │
//! │     next_retry_at = NOW() + 2^retry_count seconds,                     │
//! │     error recorded; past max retries → DEAD_LETTER (never              │
//! │     re-claimed by the normal loop)                                     │
//! │                                                                         │
//! │  RE-ENTRANCY: an atomic guard enforces a single active loop per        │
//! │  process. Publish failures stay inside the loop; the synchronous       │
//! │  caller never sees them.                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use meridian_db::{Database, OutboxRow};

use crate::broker::{DomainEvent, EventPublisher};
use crate::error::EngineResult;

// =============================================================================
// Configuration
// =============================================================================

/// Publisher knobs.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Retries before a row dead-letters.
    pub max_retries: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 8,
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Background outbox publisher.
pub struct OutboxPublisher {
    db: Database,
    broker: Arc<dyn EventPublisher>,
    config: OutboxConfig,
    /// Cooperative exclusion: one active loop per process.
    active: Arc<AtomicBool>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the publisher.
#[derive(Clone)]
pub struct OutboxPublisherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl OutboxPublisherHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl OutboxPublisher {
    /// Creates a publisher and its control handle. All publishers built
    /// from the same `active` guard exclude each other.
    pub fn new(
        db: Database,
        broker: Arc<dyn EventPublisher>,
        config: OutboxConfig,
        active: Arc<AtomicBool>,
    ) -> (Self, OutboxPublisherHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let publisher = OutboxPublisher {
            db,
            broker,
            config,
            active,
            shutdown_rx,
        };
        (publisher, OutboxPublisherHandle { shutdown_tx })
    }

    /// Runs the publisher loop. Spawn as a background task.
    pub async fn run(mut self) {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("Outbox publisher already active in this process; not starting another");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Outbox publisher starting"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_batch().await {
                        error!(?e, "Failed to process outbox batch");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Outbox publisher shutting down");
                    break;
                }
            }
        }

        self.active.store(false, Ordering::SeqCst);
        info!("Outbox publisher stopped");
    }

    /// Claims one batch of due rows and publishes them sequentially.
    async fn process_batch(&self) -> EngineResult<()> {
        let rows = self.db.outbox().claim_due(self.config.batch_size).await?;
        if rows.is_empty() {
            debug!("No due outbox rows");
            return Ok(());
        }

        info!(count = rows.len(), "Publishing outbox batch");

        for row in rows {
            self.publish_row(row).await?;
        }

        Ok(())
    }

    /// Publishes one row. Broker failures update only the row's retry
    /// state; storage failures propagate to the loop.
    async fn publish_row(&self, row: OutboxRow) -> EngineResult<()> {
        let event = event_from_row(&row);

        match self.broker.publish(&event).await {
            Ok(()) => {
                self.db.outbox().mark_completed(&row.id).await?;
                debug!(id = %row.id, aggregate_id = %row.aggregate_id, "Outbox row published");
            }
            Err(publish_error) => {
                let next_retry_count = row.retry_count + 1;
                let dead = next_retry_count > self.config.max_retries;
                self.db
                    .outbox()
                    .mark_failed(
                        &row.id,
                        &publish_error.to_string(),
                        backoff_secs(next_retry_count),
                        dead,
                    )
                    .await?;

                if dead {
                    warn!(
                        id = %row.id,
                        retry_count = next_retry_count,
                        error = %publish_error,
                        "Outbox row dead-lettered"
                    );
                } else {
                    warn!(
                        id = %row.id,
                        retry_count = next_retry_count,
                        error = %publish_error,
                        "Outbox publish failed; scheduled retry"
                    );
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Retry delay: `2^retry_count` seconds, capped at one hour so a
/// corrupted counter cannot push a row months out.
pub fn backoff_secs(retry_count: i32) -> i64 {
    let exponent = retry_count.clamp(0, 12) as u32;
    (1i64 << exponent).min(3_600)
}

/// Reconstructs the domain event from its stored row.
fn event_from_row(row: &OutboxRow) -> DomainEvent {
    DomainEvent {
        event_type: row.event_type.clone(),
        timestamp: row.created_at,
        partition_key: row.aggregate_id.clone(),
        checksum: row
            .metadata
            .get("checksum")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        payload: row.payload.clone(),
        metadata: row.metadata.clone(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
