//! # Event Publisher Contract
//!
//! The message broker is an external collaborator; this module defines
//! the minimal contract the outbox publisher speaks, the
//! `calculation.completed` envelope, and an in-memory implementation
//! for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;

/// Event type emitted after every committed calculation.
pub const CALCULATION_COMPLETED: &str = "calculation.completed";

/// A domain event bound for the broker.
///
/// The partition key is the proposal id, so consumers see one
/// proposal's events in publish order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Proposal id; the broker's partition key.
    pub partition_key: String,
    pub checksum: String,
    /// The canonical result.
    pub payload: Value,
    /// Engine version, processing time, and anything else diagnostic.
    pub metadata: Value,
}

/// Broker client contract. Implementations must be safe to call from
/// the outbox publisher loop.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> EngineResult<()>;
}

// =============================================================================
// In-Memory Publisher (tests)
// =============================================================================

/// Test publisher: records events, optionally failing the first N
/// publishes to exercise retry paths.
#[derive(Default)]
pub struct InMemoryPublisher {
    events: std::sync::Mutex<Vec<DomainEvent>>,
    fail_remaining: std::sync::atomic::AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        InMemoryPublisher::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Events published so far, in order.
    pub fn published(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("publisher lock poisoned").clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &DomainEvent) -> EngineResult<()> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(crate::error::EngineError::EventPublish(
                "injected publish failure".to_string(),
            ));
        }
        self.events
            .lock()
            .expect("publisher lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
