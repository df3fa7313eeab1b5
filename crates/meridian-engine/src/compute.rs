//! Compute-stage wrapper.
//!
//! The pure stage itself holds no clock; its 5-second wall ceiling is
//! enforced here by running it on a blocking thread under a timeout.
//! The deterministic cost estimate inside the validation floor rejects
//! oversized work up front; the timeout is the backstop for everything
//! the estimate cannot see.

use std::sync::Arc;
use std::time::Duration;

use meridian_core::types::{CalculationResult, FrozenInput};
use meridian_core::validate::ComputeLimits;

use crate::error::{EngineError, EngineResult};

/// Runs the pure compute stage with a wall-clock ceiling.
pub async fn run_compute(
    input: Arc<FrozenInput>,
    limits: ComputeLimits,
    ceiling: Duration,
) -> EngineResult<CalculationResult> {
    let task =
        tokio::task::spawn_blocking(move || meridian_core::compute::compute_with_limits(&input, &limits));

    match tokio::time::timeout(ceiling, task).await {
        Err(_) => Err(EngineError::Timeout {
            stage: "compute".to_string(),
        }),
        Ok(Err(join_error)) => Err(EngineError::Internal(format!(
            "compute task failed: {join_error}"
        ))),
        Ok(Ok(outcome)) => outcome.map_err(EngineError::from),
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

    use meridian_core::types::*;

    fn input() -> Arc<FrozenInput> {
        Arc::new(FrozenInput {
            proposal_id: "p1".into(),
            tenant: None,
            schema_version: "1".into(),
            line_items: vec![LineItem {
                id: "a".into(),
                unit_price: dec!(100),
                quantity: dec!(2),
                cost: None,
                tax_setting: TaxSetting::Taxable,
                use_tax_eligible: false,
                vendor_tax_collected: false,
            }],
            modifiers: vec![],
            dependencies: vec![],
            rules: vec![],
            tax_config: TaxConfig {
                mode: TaxMode::Retail,
                retail_rate: dec!(0.10),
                use_tax_rate: dec!(0),
                jurisdictions: vec![],
                schema_version: "1".into(),
            },
            context_seed: json!({}),
            fingerprint: "fp".into(),
        })
    }

    #[tokio::test]
    async fn test_compute_inside_ceiling() {
        let result = run_compute(input(), ComputeLimits::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.customer_grand_total, "220.00");
    }

    #[tokio::test]
    async fn test_core_errors_keep_their_kind() {
        let mut frozen = (*input()).clone();
        frozen.modifiers = vec![
            Modifier {
                id: "dup".into(),
                kind: ModifierKind::Percentage,
                value: dec!(-1),
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
            };
            2
        ];
        let err = run_compute(Arc::new(frozen), ComputeLimits::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }
}
