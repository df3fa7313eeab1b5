//! # Commit Stage
//!
//! Persists a computed result exactly once.
//!
//! ## Commit Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  commit(input, result)                                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  idempotency consult (L1 cache, then store, keyed by checksum)         │
//! │       │                                                                 │
//! │       ├── HIT ──► return stored result                                 │
//! │       │          (IDEMPOTENCY_REPLAY: no writes, no events,            │
//! │       │           no webhooks)                                          │
//! │       ▼                                                                 │
//! │  advisory lock on hash32(proposal_id)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────── SINGLE TRANSACTION ─────────────────┐               │
//! │  │ 1. upsert calculation_results (ON CONFLICT UPDATE)  │               │
//! │  │ 2. upsert calc_audit + groups (UNIQUE checksum)     │               │
//! │  │ 3. insert PENDING outbox row (calculation.completed)│               │
//! │  └─────────────────────────────────────────────────────┘               │
//! │       │                                                                 │
//! │  COMMIT, release lock                                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  post-commit only: fill caches, record metrics, fan out webhooks       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A database error rolls the transaction back, releases the lock, and
//! propagates; the outbox row dies with the transaction, so no event
//! can outlive a failed commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_core::types::{Adjustment, CalculationResult, FrozenInput};
use meridian_core::ENGINE_VERSION;

use meridian_db::{AuditGroup, AuditRecord, Database, ProposalLock};

use crate::broker::CALCULATION_COMPLETED;
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsRegistry;
use crate::prepare::cache::TtlCache;
use crate::webhook::WebhookDispatcher;

// =============================================================================
// Types
// =============================================================================

/// Timing context carried into the commit for the audit row.
#[derive(Debug, Clone, Copy)]
pub struct CommitContext {
    pub started_at: DateTime<Utc>,
    pub preparation_ms: u64,
    pub compute_ms: u64,
}

/// What the commit produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub result: Arc<CalculationResult>,
    /// True when an identical computation was already committed and the
    /// stored result was replayed without any writes.
    pub replay: bool,
}

// =============================================================================
// Stage
// =============================================================================

/// The commit stage.
pub struct CommitStage {
    db: Database,
    /// Idempotency store front: checksum → committed result.
    idempotency: TtlCache<String, Arc<CalculationResult>>,
    /// L1 result cache for read paths.
    results: TtlCache<String, Arc<CalculationResult>>,
    webhooks: Arc<WebhookDispatcher>,
    metrics: Arc<MetricsRegistry>,
}

impl CommitStage {
    pub fn new(
        db: Database,
        cache_ttl: Duration,
        cache_capacity: usize,
        webhooks: Arc<WebhookDispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        CommitStage {
            db,
            idempotency: TtlCache::new(cache_ttl, cache_capacity),
            results: TtlCache::new(cache_ttl, cache_capacity),
            webhooks,
            metrics,
        }
    }

    /// Commits one result idempotently.
    pub async fn commit(
        &self,
        input: &FrozenInput,
        result: CalculationResult,
        ctx: CommitContext,
    ) -> EngineResult<CommitOutcome> {
        let checksum = result.checksum.clone();

        // Idempotency consult before any write.
        if let Some(stored) = self.idempotency.get(&checksum) {
            info!(checksum = %checksum, "Idempotency replay (cache)");
            return Ok(CommitOutcome { result: stored, replay: true });
        }
        if let Some(stored) = self.db.results().find_by_checksum(&checksum).await? {
            info!(checksum = %checksum, "Idempotency replay (store)");
            let stored = Arc::new(stored);
            self.idempotency.insert(checksum, stored.clone());
            return Ok(CommitOutcome { result: stored, replay: true });
        }

        let audit = build_audit(input, &result, ctx);
        let event_payload =
            serde_json::to_value(&result).expect("result serialization is infallible");
        let event_metadata = json!({
            "checksum": checksum,
            "timestamp": Utc::now().to_rfc3339(),
            "engineVersion": ENGINE_VERSION,
            "processingMs": ctx.preparation_ms + ctx.compute_ms,
        });

        // Per-proposal exclusion: acquired before the transaction,
        // released after commit. The lock guard closes its connection on
        // every non-release path.
        let mut lock = ProposalLock::acquire(self.db.pool(), &input.proposal_id).await?;

        let transaction = async {
            let mut tx = lock.connection().begin().await.map_err(map_sqlx)?;

            self.db.results().upsert_result(&mut tx, &result).await?;
            self.db.results().upsert_audit(&mut tx, &audit).await?;
            self.db
                .outbox()
                .enqueue(
                    &mut tx,
                    CALCULATION_COMPLETED,
                    &input.proposal_id,
                    &event_payload,
                    &event_metadata,
                )
                .await?;

            tx.commit().await.map_err(map_sqlx)?;
            Ok::<(), EngineError>(())
        }
        .await;

        match transaction {
            Ok(()) => lock.release().await?,
            Err(error) => {
                warn!(proposal_id = %input.proposal_id, %error, "Commit transaction failed");
                drop(lock);
                return Err(error);
            }
        }

        // Writes are only cached after the transaction committed.
        let result = Arc::new(result);
        self.idempotency
            .insert(result.checksum.clone(), result.clone());
        self.results.insert(result.checksum.clone(), result.clone());
        self.fan_out_webhooks(&result, &event_metadata);

        debug!(
            proposal_id = %input.proposal_id,
            checksum = %result.checksum,
            "Commit complete"
        );
        Ok(CommitOutcome { result, replay: false })
    }

    /// L1 result lookup by checksum.
    pub fn cached_result(&self, checksum: &str) -> Option<Arc<CalculationResult>> {
        self.results.get(&checksum.to_string())
    }

    fn fan_out_webhooks(&self, result: &Arc<CalculationResult>, metadata: &serde_json::Value) {
        if !self.webhooks.is_active() {
            return;
        }
        let webhooks = Arc::clone(&self.webhooks);
        let metrics = Arc::clone(&self.metrics);
        let data = serde_json::to_value(result.as_ref())
            .expect("result serialization is infallible");
        let metadata = metadata.clone();

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            webhooks
                .dispatch(CALCULATION_COMPLETED, &data, &metadata)
                .await;
            metrics.webhook.record(started.elapsed());
        });
    }
}

fn map_sqlx(error: sqlx::Error) -> EngineError {
    EngineError::Database(meridian_db::DbError::QueryFailed(error))
}

// =============================================================================
// Audit Construction
// =============================================================================

/// Builds the audit row for one committed computation.
fn build_audit(input: &FrozenInput, result: &CalculationResult, ctx: CommitContext) -> AuditRecord {
    AuditRecord {
        calc_id: Uuid::new_v4().to_string(),
        proposal_id: input.proposal_id.clone(),
        tenant: input.tenant.clone(),
        version: input.schema_version.clone(),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        phase_timings: json!({
            "preparationMs": ctx.preparation_ms,
            "computeMs": ctx.compute_ms,
        }),
        subtotal_q7: result.subtotal_q7.clone(),
        modifier_total_q7: result.modifier_total_q7.clone(),
        taxable_base_q7: result.taxable_base_q7.clone(),
        non_taxable_q7: result.non_taxable_base_q7.clone(),
        retail_tax_q7: result.retail_tax_q7.clone(),
        use_tax_q7: result.use_tax_q7.clone(),
        customer_grand_total_q7: result.customer_grand_total_q7.clone(),
        grand_total_q2: result.customer_grand_total.clone(),
        tax_mode: result.tax_mode.clone(),
        engine_version: result.engine_version.clone(),
        checksum: result.checksum.clone(),
        groups: result.adjustments.iter().map(audit_group).collect(),
    }
}

fn audit_group(adjustment: &Adjustment) -> AuditGroup {
    AuditGroup {
        group_key: adjustment.group_key.clone(),
        attributes: json!({
            "taxSetting": adjustment.tax_setting,
            "kind": adjustment.kind,
            "category": adjustment.category,
            "applicationType": adjustment.application_type,
        }),
        combined_value: adjustment.combined_value.clone(),
        adjustment_q7: adjustment.amount_q7.clone(),
        modifier_ids: adjustment.modifier_ids.clone(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use meridian_core::compute;
    use meridian_core::types::*;

    fn input() -> FrozenInput {
        FrozenInput {
            proposal_id: "p1".into(),
            tenant: Some("acme".into()),
            schema_version: "3".into(),
            line_items: vec![LineItem {
                id: "a".into(),
                unit_price: dec!(100),
                quantity: dec!(2),
                cost: None,
                tax_setting: TaxSetting::Taxable,
                use_tax_eligible: false,
                vendor_tax_collected: false,
            }],
            modifiers: vec![Modifier {
                id: "d".into(),
                kind: ModifierKind::Percentage,
                value: dec!(-10),
                tax_setting: ModifierTaxSetting::Inherit,
                category: ModifierCategory::Discount,
                affects_quantity: false,
                cost_percentage: None,
                display_mode: "standard".into(),
                application_type: ApplicationType::PreTax,
                product_id: None,
                chain_priority: 999,
                line_item_id: None,
                created_at: None,
                missing_cost_strategy: MissingCostStrategy::Skip,
            }],
            dependencies: vec![],
            rules: vec![],
            tax_config: TaxConfig {
                mode: TaxMode::Retail,
                retail_rate: dec!(0.10),
                use_tax_rate: dec!(0),
                jurisdictions: vec![],
                schema_version: "3".into(),
            },
            context_seed: json!({}),
            fingerprint: "fp".into(),
        }
    }

    #[test]
    fn test_audit_record_mirrors_result() {
        let frozen = input();
        let result = compute(&frozen).unwrap();
        let audit = build_audit(
            &frozen,
            &result,
            CommitContext {
                started_at: Utc::now(),
                preparation_ms: 4,
                compute_ms: 2,
            },
        );

        assert_eq!(audit.proposal_id, "p1");
        assert_eq!(audit.tenant.as_deref(), Some("acme"));
        assert_eq!(audit.version, "3");
        assert_eq!(audit.checksum, result.checksum);
        assert_eq!(audit.subtotal_q7, result.subtotal_q7);
        assert_eq!(audit.grand_total_q2, result.customer_grand_total);
        assert_eq!(audit.groups.len(), 1);
        assert_eq!(audit.groups[0].modifier_ids, vec!["d"]);
        assert_eq!(audit.phase_timings["preparationMs"], 4);
    }

    #[test]
    fn test_audit_group_attributes_cover_tax_classification() {
        let frozen = input();
        let result = compute(&frozen).unwrap();
        let group = audit_group(&result.adjustments[0]);

        assert_eq!(group.attributes["taxSetting"], json!("TAXABLE"));
        assert_eq!(group.attributes["kind"], json!("percentage"));
        assert_eq!(group.attributes["applicationType"], json!("pre_tax"));
        assert_eq!(group.adjustment_q7, result.adjustments[0].amount_q7);
    }
}
