//! # Proposal Snapshot Repository
//!
//! Fetches a consistent snapshot of one proposal's inputs.
//!
//! ## Consistency
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  All five reads for one request share a single REPEATABLE READ         │
//! │  transaction, so concurrent writers cannot tear the snapshot:          │
//! │                                                                         │
//! │    1. proposal                                                          │
//! │    2. line items      ORDER BY id                                       │
//! │    3. modifiers       ORDER BY chain_priority, id                       │
//! │    4. dependencies    ORDER BY depends_on, modifier_id                  │
//! │    5. rules           for the fetched modifier ids                      │
//! │                                                                         │
//! │  Arrays are then re-sorted in process memory with plain byte-wise      │
//! │  ordering, which neutralises database collation variance.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows come back as raw text/JSON; the preparation stage normalises
//! them into typed, canonical form.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for proposal snapshot reads.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: PgPool,
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProposalRow {
    pub id: String,
    pub tenant_id: Option<String>,
    pub schema_version: String,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LineItemRow {
    pub id: String,
    pub unit_price: String,
    pub quantity: String,
    pub cost: Option<String>,
    pub tax_setting: String,
    pub use_tax_eligible: bool,
    pub vendor_tax_collected: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModifierRow {
    pub id: String,
    pub kind: String,
    pub value: String,
    pub tax_setting: String,
    pub category: String,
    pub affects_quantity: bool,
    pub cost_percentage: Option<String>,
    pub display_mode: String,
    pub application_type: String,
    pub product_id: Option<String>,
    pub chain_priority: i32,
    pub line_item_id: Option<String>,
    pub missing_cost_strategy: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DependencyRow {
    pub modifier_id: String,
    pub depends_on: String,
    pub dependency_type: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleRow {
    pub modifier_id: String,
    pub expression: serde_json::Value,
}

/// One proposal's inputs, read under a single consistent snapshot.
#[derive(Debug, Clone)]
pub struct ProposalSnapshot {
    pub proposal: ProposalRow,
    pub line_items: Vec<LineItemRow>,
    pub modifiers: Vec<ModifierRow>,
    pub dependencies: Vec<DependencyRow>,
    pub rules: Vec<RuleRow>,
}

// =============================================================================
// Repository
// =============================================================================

impl SnapshotRepository {
    /// Creates a new SnapshotRepository.
    pub fn new(pool: PgPool) -> Self {
        SnapshotRepository { pool }
    }

    /// Fetches a consistent snapshot, or `None` if the proposal does
    /// not exist.
    pub async fn fetch(&self, proposal_id: &str) -> DbResult<Option<ProposalSnapshot>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let proposal: Option<ProposalRow> = sqlx::query_as::<_, ProposalRow>(
            r#"
            SELECT id, tenant_id, schema_version, metadata, updated_at
            FROM proposals
            WHERE id = $1
            "#,
        )
        .bind(proposal_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(proposal) = proposal else {
            tx.rollback().await?;
            return Ok(None);
        };

        let line_items: Vec<LineItemRow> = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT id, unit_price, quantity, cost, tax_setting,
                   use_tax_eligible, vendor_tax_collected
            FROM proposal_line_items
            WHERE proposal_id = $1
            ORDER BY id
            "#,
        )
        .bind(proposal_id)
        .fetch_all(&mut *tx)
        .await?;

        let modifiers: Vec<ModifierRow> = sqlx::query_as::<_, ModifierRow>(
            r#"
            SELECT id, kind, value, tax_setting, category, affects_quantity,
                   cost_percentage, display_mode, application_type, product_id,
                   chain_priority, line_item_id, missing_cost_strategy, created_at
            FROM proposal_modifiers
            WHERE proposal_id = $1
            ORDER BY chain_priority, id
            "#,
        )
        .bind(proposal_id)
        .fetch_all(&mut *tx)
        .await?;

        let dependencies: Vec<DependencyRow> = sqlx::query_as::<_, DependencyRow>(
            r#"
            SELECT modifier_id, depends_on, dependency_type
            FROM proposal_dependencies
            WHERE proposal_id = $1
            ORDER BY depends_on, modifier_id
            "#,
        )
        .bind(proposal_id)
        .fetch_all(&mut *tx)
        .await?;

        let modifier_ids: Vec<String> = modifiers.iter().map(|m| m.id.clone()).collect();
        let rules: Vec<RuleRow> = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT modifier_id, expression
            FROM proposal_rules
            WHERE proposal_id = $1 AND modifier_id = ANY($2)
            ORDER BY modifier_id
            "#,
        )
        .bind(proposal_id)
        .bind(&modifier_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut snapshot = ProposalSnapshot {
            proposal,
            line_items,
            modifiers,
            dependencies,
            rules,
        };
        resort(&mut snapshot);

        debug!(
            proposal_id,
            line_items = snapshot.line_items.len(),
            modifiers = snapshot.modifiers.len(),
            "Fetched proposal snapshot"
        );

        Ok(Some(snapshot))
    }
}

/// Re-sorts all arrays with Rust's byte-wise string ordering. The
/// database already ordered them, but its collation may not be
/// byte-wise; downstream determinism requires exactly one ordering.
fn resort(snapshot: &mut ProposalSnapshot) {
    snapshot.line_items.sort_by(|a, b| a.id.cmp(&b.id));
    snapshot
        .modifiers
        .sort_by(|a, b| (a.chain_priority, a.id.as_str()).cmp(&(b.chain_priority, b.id.as_str())));
    snapshot.dependencies.sort_by(|a, b| {
        (a.depends_on.as_str(), a.modifier_id.as_str())
            .cmp(&(b.depends_on.as_str(), b.modifier_id.as_str()))
    });
    snapshot
        .rules
        .sort_by(|a, b| a.modifier_id.cmp(&b.modifier_id));
}

// =============================================================================
// Unit Tests
// =============================================================================
