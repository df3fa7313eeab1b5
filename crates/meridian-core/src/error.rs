//! # Error Types
//!
//! Domain-specific error types for meridian-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  meridian-core errors (this file)                                      │
//! │  ├── CoreError   - Pure-stage failures (validation, limits, rules)     │
//! │  └── Violation   - One specific input problem inside InvalidInput      │
//! │                                                                         │
//! │  meridian-db errors (separate crate)                                   │
//! │  └── DbError     - Database operation failures                         │
//! │                                                                         │
//! │  meridian-engine errors (separate crate)                               │
//! │  └── EngineError - Full taxonomy seen by callers                       │
//! │                                                                         │
//! │  Flow: CoreError → EngineError → structured response to caller        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (modifier id, field, limit)
//! 3. Errors are enum variants, never bare strings
//! 4. Resource-limit failures are distinct from validation failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Violation
// =============================================================================

/// One specific input problem. `InvalidInput` carries a list of these so a
/// caller can see every problem at once instead of fixing them one by one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Dotted path of the offending field (e.g. `modifiers[3].value`).
    pub field: String,

    /// Human-readable description of the problem.
    pub message: String,
}

impl Violation {
    /// Creates a violation for the given field.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Violation {
            field: field.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Pure-stage errors.
///
/// All failures here are deterministic: the same frozen input always fails
/// the same way. No partial result is ever returned alongside an error.
/// `Clone` because coalesced preparations fan one failure out to every
/// waiting caller.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed input: duplicate IDs, bad numerics, dangling references,
    /// dependency cycles. Carries every violation found.
    #[error("Invalid input: {}", format_violations(.0))]
    InvalidInput(Vec<Violation>),

    /// Margin target outside `[0, 1)`.
    ///
    /// ## When This Occurs
    /// - A margin modifier carries `value < 0` or `value >= 100`
    ///   (value is a percentage; `100` would divide by zero)
    #[error("Invalid margin {value} on modifier {modifier_id}: target must be in [0%, 100%)")]
    InvalidMargin { modifier_id: String, value: String },

    /// A resource ceiling was exceeded.
    ///
    /// ## When This Occurs
    /// - Too many line items, modifiers, or groups
    /// - Dependency chains deeper than the limit
    /// - The deterministic cost estimate exceeds the compute budget
    #[error("Resource limit exceeded: {resource} = {actual}, limit {limit}")]
    ResourceLimit {
        resource: String,
        actual: u64,
        limit: u64,
    },

    /// A rule expression failed to compile (too deep, too many nodes,
    /// disallowed field path, unknown operator).
    #[error("Rule for modifier {modifier_id} failed to compile: {reason}")]
    RuleCompile { modifier_id: String, reason: String },

    /// A rule evaluation exceeded its operation budget or depth limit.
    ///
    /// Note: the compute stage catches this per modifier and discards only
    /// that modifier; it surfaces directly only from standalone evaluation.
    #[error("Rule evaluation failed: {reason}")]
    RuleEval { reason: String },
}

impl CoreError {
    /// Single-violation convenience constructor.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::InvalidInput(vec![Violation::new(field, message)])
    }

    /// The wire taxonomy kind for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "INVALID_INPUT",
            CoreError::InvalidMargin { .. } => "INVALID_MARGIN",
            CoreError::ResourceLimit { .. } => "RESOURCE_LIMIT",
            CoreError::RuleCompile { .. } => "RULE_COMPILE_ERROR",
            CoreError::RuleEval { .. } => "RULE_EVAL_ERROR",
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
