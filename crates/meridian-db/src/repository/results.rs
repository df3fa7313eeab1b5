//! # Results Repository
//!
//! Persists calculation results, audit rows, and audit groups. The
//! write methods take a caller-provided connection so the commit stage
//! can put them inside one transaction together with the outbox insert
//! (same-transaction atomicity is the whole point of the outbox
//! pattern).

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use meridian_core::types::CalculationResult;

use crate::error::{DbError, DbResult};

/// Repository for calculation results and the audit trail.
#[derive(Debug, Clone)]
pub struct ResultsRepository {
    pool: PgPool,
}

// =============================================================================
// Records
// =============================================================================

/// One row of `calc_audit` plus its groups.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub calc_id: String,
    pub proposal_id: String,
    pub tenant: Option<String>,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase_timings: serde_json::Value,
    pub subtotal_q7: String,
    pub modifier_total_q7: String,
    pub taxable_base_q7: String,
    pub non_taxable_q7: String,
    pub retail_tax_q7: String,
    pub use_tax_q7: Option<String>,
    pub customer_grand_total_q7: String,
    pub grand_total_q2: String,
    pub tax_mode: String,
    pub engine_version: String,
    pub checksum: String,
    pub groups: Vec<AuditGroup>,
}

/// One applied group, denormalised for the audit trail.
#[derive(Debug, Clone)]
pub struct AuditGroup {
    pub group_key: String,
    pub attributes: serde_json::Value,
    pub combined_value: String,
    pub adjustment_q7: String,
    pub modifier_ids: Vec<String>,
}

// =============================================================================
// Repository
// =============================================================================

impl ResultsRepository {
    /// Creates a new ResultsRepository.
    pub fn new(pool: PgPool) -> Self {
        ResultsRepository { pool }
    }

    /// Looks up a stored result by checksum (the idempotency store).
    pub async fn find_by_checksum(&self, checksum: &str) -> DbResult<Option<CalculationResult>> {
        let payload: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT payload
            FROM calculation_results
            WHERE checksum = $1
            "#,
        )
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        match payload {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| DbError::CorruptValue {
                    table: "calculation_results".into(),
                    column: "payload".into(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Upserts the per-proposal result row. Part of the commit
    /// transaction: `conn` must belong to it.
    pub async fn upsert_result(
        &self,
        conn: &mut PgConnection,
        result: &CalculationResult,
    ) -> DbResult<()> {
        let payload = serde_json::to_value(result).map_err(|e| DbError::CorruptValue {
            table: "calculation_results".into(),
            column: "payload".into(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO calculation_results (
                proposal_id, subtotal, modifier_total, retail_tax, total,
                checksum, payload, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (proposal_id) DO UPDATE SET
                subtotal = EXCLUDED.subtotal,
                modifier_total = EXCLUDED.modifier_total,
                retail_tax = EXCLUDED.retail_tax,
                total = EXCLUDED.total,
                checksum = EXCLUDED.checksum,
                payload = EXCLUDED.payload,
                updated_at = NOW()
            "#,
        )
        .bind(&result.proposal_id)
        .bind(&result.subtotal)
        .bind(&result.modifier_total)
        .bind(&result.retail_tax)
        .bind(&result.customer_grand_total)
        .bind(&result.checksum)
        .bind(&payload)
        .execute(&mut *conn)
        .await?;

        debug!(proposal_id = %result.proposal_id, checksum = %result.checksum, "Upserted result");
        Ok(())
    }

    /// Upserts the audit row keyed on checksum, plus its groups. A
    /// checksum conflict means this exact computation is already
    /// audited; the row and its groups are left untouched.
    pub async fn upsert_audit(
        &self,
        conn: &mut PgConnection,
        audit: &AuditRecord,
    ) -> DbResult<()> {
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO calc_audit (
                calc_id, proposal_id, tenant, version,
                started_at, finished_at, phase_timings,
                subtotal_q7, modifier_total_q7, taxable_base_q7, non_taxable_q7,
                retail_tax_q7, use_tax_q7, customer_grand_total_q7, grand_total_q2,
                tax_mode, engine_version, checksum
            ) VALUES (
                $1, $2, $3, $4,
                $5, $6, $7,
                $8, $9, $10, $11,
                $12, $13, $14, $15,
                $16, $17, $18
            )
            ON CONFLICT (checksum) DO NOTHING
            RETURNING calc_id
            "#,
        )
        .bind(&audit.calc_id)
        .bind(&audit.proposal_id)
        .bind(&audit.tenant)
        .bind(&audit.version)
        .bind(audit.started_at)
        .bind(audit.finished_at)
        .bind(&audit.phase_timings)
        .bind(&audit.subtotal_q7)
        .bind(&audit.modifier_total_q7)
        .bind(&audit.taxable_base_q7)
        .bind(&audit.non_taxable_q7)
        .bind(&audit.retail_tax_q7)
        .bind(&audit.use_tax_q7)
        .bind(&audit.customer_grand_total_q7)
        .bind(&audit.grand_total_q2)
        .bind(&audit.tax_mode)
        .bind(&audit.engine_version)
        .bind(&audit.checksum)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(calc_id) = inserted else {
            debug!(checksum = %audit.checksum, "Audit row already present; skipped");
            return Ok(());
        };

        for (position, group) in audit.groups.iter().enumerate() {
            let modifier_ids = serde_json::to_value(&group.modifier_ids)
                .expect("string list serialization is infallible");
            sqlx::query(
                r#"
                INSERT INTO calc_audit_groups (
                    calc_id, position, group_key, attributes,
                    combined_value, adjustment_q7, modifier_ids
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&calc_id)
            .bind(position as i32)
            .bind(&group.group_key)
            .bind(&group.attributes)
            .bind(&group.combined_value)
            .bind(&group.adjustment_q7)
            .bind(&modifier_ids)
            .execute(&mut *conn)
            .await?;
        }

        debug!(calc_id = %calc_id, groups = audit.groups.len(), "Inserted audit row");
        Ok(())
    }
}
