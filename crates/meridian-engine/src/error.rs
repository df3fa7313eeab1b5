//! # Engine Error Types
//!
//! The full error taxonomy callers see.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Taxonomy                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Pure stage    │  │   Preparation   │  │       Commit            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  INVALID_INPUT  │  │  DATA_FETCH_    │  │  DATABASE_ERROR         │ │
//! │  │  INVALID_MARGIN │  │    ERROR        │  │  EVENT_PUBLISH_ERROR    │ │
//! │  │  RESOURCE_LIMIT │  │  RULE_COMPILE_  │  │  WEBHOOK_ERROR          │ │
//! │  │  RULE_EVAL_     │  │    ERROR        │  │                         │ │
//! │  │    ERROR        │  │  RESOURCE_LIMIT │  │  (IDEMPOTENCY_REPLAY is │ │
//! │  │                 │  │    (timeout)    │  │   informational, not    │ │
//! │  └─────────────────┘  └─────────────────┘  │   an error)             │ │
//! │                                            └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A caller receives either the complete result or one structured error
//! carrying `kind()`, a human message, and (for input errors) the
//! violation list.

use meridian_core::error::{CoreError, Violation};
use meridian_db::DbError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type covering the whole pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Pure-Stage Errors
    // =========================================================================
    /// Validation, margin, limit, and rule errors from meridian-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Preparation Errors
    // =========================================================================
    /// Snapshot load failed.
    #[error("Data fetch failed: {0}")]
    DataFetch(String),

    /// A stage exceeded its deadline. Reported under `RESOURCE_LIMIT`,
    /// detail `timeout`.
    #[error("Timeout in {stage} stage")]
    Timeout { stage: String },

    // =========================================================================
    // Commit Errors
    // =========================================================================
    /// Database write failed. The commit transaction was rolled back;
    /// no outbox row survives it.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Broker publish failed. Local to the outbox loop; never surfaces
    /// to a synchronous caller.
    #[error("Event publish failed: {0}")]
    EventPublish(String),

    /// Webhook delivery failed. Logged, never propagated to callers.
    #[error("Webhook delivery failed: {0}")]
    Webhook(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Configuration is invalid. Startup-time only; the ops binary exits
    /// with code 1 on this.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine has been shut down; no further calls are accepted.
    #[error("Engine is shut down")]
    Shutdown,

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The wire taxonomy kind for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Core(e) => e.kind(),
            EngineError::DataFetch(_) => "DATA_FETCH_ERROR",
            EngineError::Timeout { .. } => "RESOURCE_LIMIT",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::EventPublish(_) => "EVENT_PUBLISH_ERROR",
            EngineError::Webhook(_) => "WEBHOOK_ERROR",
            EngineError::Config(_) | EngineError::Shutdown | EngineError::Internal(_) => "INTERNAL",
        }
    }

    /// The violation list for input errors, empty otherwise.
    pub fn violations(&self) -> &[Violation] {
        match self {
            EngineError::Core(CoreError::InvalidInput(violations)) => violations,
            _ => &[],
        }
    }

    /// Single-violation INVALID_INPUT convenience constructor.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Core(CoreError::invalid(field, message))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::invalid("x", "y").kind(), "INVALID_INPUT");
        assert_eq!(
            EngineError::Timeout { stage: "compute".into() }.kind(),
            "RESOURCE_LIMIT"
        );
        assert_eq!(EngineError::DataFetch("boom".into()).kind(), "DATA_FETCH_ERROR");
        assert_eq!(EngineError::EventPublish("broker down".into()).kind(), "EVENT_PUBLISH_ERROR");
        assert_eq!(EngineError::Shutdown.kind(), "INTERNAL");
    }

    #[test]
    fn test_violations_exposed_for_input_errors() {
        let err = EngineError::invalid("modifiers[0].id", "duplicate");
        assert_eq!(err.violations().len(), 1);
        assert!(EngineError::Shutdown.violations().is_empty());
    }
}
