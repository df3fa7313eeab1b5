//! # meridian-core: Pure Pricing Logic for Meridian
//!
//! This crate is the **heart** of the Meridian pricing engine. It contains
//! the entire pure computation stage plus the shared collaborators
//! (decimal policy, canonical encoding, fingerprinting, rule evaluation)
//! as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Meridian Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                meridian-engine (Service Layer)                  │   │
//! │  │    Prepare ──► Compute ──► Commit ──► Outbox ──► Webhooks      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ meridian-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  decimal  │  │ canonical │  │   rules   │  │  compute  │  │   │
//! │  │   │  Q7 / Q2  │  │  encoder  │  │  safe AST │  │  pipeline │  │   │
//! │  │   │  rounding │  │  + SHA256 │  │ evaluator │  │  subtotal │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  │  modifiers│  │   │
//! │  │                                                │  taxes    │  │   │
//! │  │   NO I/O • NO CLOCKS • NO RANDOMNESS           └───────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                meridian-db (PostgreSQL Layer)                   │   │
//! │  │     snapshots, results, audit rows, outbox, advisory locks     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (LineItem, Modifier, TaxConfig, results)
//! - [`decimal`] - Q7/Q2 decimal policy (half-away-from-zero, no floats!)
//! - [`canonical`] - Byte-stable canonical JSON encoding
//! - [`fingerprint`] - SHA-256 content fingerprints over canonical bytes
//! - [`rules`] - Safe boolean rule AST: compiler and interpreter
//! - [`validate`] - The validation floor and resource ceilings
//! - [`compute`] - The pure compute stage
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same frozen input = bit-identical result
//! 2. **No I/O**: database, network, clocks, randomness are FORBIDDEN here
//! 3. **Decimal Money**: all monetary values are `rust_decimal::Decimal`
//!    at Q7, rendered as decimal strings (never through `f64`)
//! 4. **Explicit Errors**: all failures are typed, never strings or panics

pub mod canonical;
pub mod compute;
pub mod decimal;
pub mod error;
pub mod fingerprint;
pub mod rules;
pub mod types;
pub mod validate;

pub use compute::compute;
pub use error::{CoreError, CoreResult, Violation};
pub use types::{
    Adjustment, CalculationResult, Dependency, DependencyType, FrozenInput, GroupKey,
    Jurisdiction, JurisdictionTax, LineItem, MissingCostStrategy, Modifier, ModifierCategory,
    ModifierKind, ModifierTaxSetting, RejectedModifier, TaxConfig, TaxMode, TaxSetting,
};

// =============================================================================
// Engine Constants
// =============================================================================

/// Engine version stamped into results, audit rows, and event metadata.
pub const ENGINE_VERSION: &str = "2.4.0";

/// Soft ceiling on line items per computation.
pub const MAX_LINE_ITEMS: usize = 5_000;

/// Soft ceiling on modifiers per computation.
pub const MAX_MODIFIERS: usize = 1_000;

/// Hard ceiling on modifiers. Exceeding this aborts immediately.
pub const HARD_MAX_MODIFIERS: usize = 2_000;

/// Soft ceiling on modifier groups after grouping.
pub const MAX_GROUPS: usize = 100;

/// Hard ceiling on modifier groups.
pub const HARD_MAX_GROUPS: usize = 250;

/// Maximum dependency chain length.
pub const MAX_DEPENDENCY_DEPTH: usize = 10;

/// Default chain priority when a modifier does not carry one.
pub const DEFAULT_CHAIN_PRIORITY: i32 = 999;
