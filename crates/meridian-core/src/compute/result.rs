//! # Result Construction
//!
//! Renders the pipeline's internal state into the canonical
//! [`CalculationResult`] and stamps it with its checksum.
//!
//! Every monetary field is rendered to its final Q2/Q7 string here, in
//! one place. The checksum is SHA-256 over the canonical encoding of the
//! result with the checksum field itself excluded; orchestrator
//! diagnostics (timings) are attached outside this type and never enter
//! the preimage.

use rust_decimal::Decimal;

use crate::decimal::{format_q2, format_q7, round_q2};
use crate::fingerprint::fingerprint;
use crate::types::{
    Adjustment, CalculationResult, FrozenInput, LineAllocation, RejectedModifier,
};
use crate::ENGINE_VERSION;

use super::apply::AppliedGroup;
use super::grouping::ModifierGroup;
use super::tax::{RetailTax, UseTax};

/// Everything the builder needs, gathered by the pipeline.
pub struct ResultParts<'a> {
    pub input: &'a FrozenInput,
    pub subtotal: Decimal,
    pub taxable_base: Decimal,
    pub non_taxable_base: Decimal,
    /// Running total after post-tax groups, excluding taxes.
    pub running_total: Decimal,
    /// Applied groups in application order.
    pub applied: Vec<(ModifierGroup, AppliedGroup)>,
    pub rejected: Vec<RejectedModifier>,
    pub retail: RetailTax,
    pub use_tax: UseTax,
}

/// Builds the canonical result and inserts its checksum.
pub fn build(parts: ResultParts<'_>) -> CalculationResult {
    let modifier_total: Decimal = parts.applied.iter().map(|(_, a)| a.amount).sum();
    let customer_grand_total_q7 = parts.running_total + parts.retail.amount;
    let customer_grand_total = round_q2(customer_grand_total_q7);

    let adjustments: Vec<Adjustment> = parts
        .applied
        .iter()
        .map(|(group, outcome)| Adjustment {
            group_key: group.key.canonical_string(),
            tax_setting: group.key.tax_setting,
            kind: group.key.kind,
            category: group.key.category,
            application_type: group.key.application_type,
            combined_value: group.combined_value.normalize().to_string(),
            amount: format_q2(outcome.amount),
            amount_q7: format_q7(outcome.amount),
            modifier_ids: group.modifier_ids(),
            per_line_allocations: outcome
                .allocations
                .iter()
                .map(|(line_id, amount)| LineAllocation {
                    line_item_id: line_id.clone(),
                    amount_q7: format_q7(*amount),
                })
                .collect(),
        })
        .collect();

    let emits_use_tax = parts.input.tax_config.mode.use_tax();

    let mut result = CalculationResult {
        proposal_id: parts.input.proposal_id.clone(),
        schema_version: parts.input.schema_version.clone(),
        engine_version: ENGINE_VERSION.to_string(),
        tax_mode: parts.input.tax_config.mode.as_str().to_string(),

        subtotal: format_q2(parts.subtotal),
        modifier_total: format_q2(modifier_total),
        retail_tax: format_q2(parts.retail.amount),
        customer_grand_total: format_q2(customer_grand_total),
        use_tax: emits_use_tax.then(|| format_q2(parts.use_tax.amount)),
        use_tax_base: emits_use_tax.then(|| format_q2(parts.use_tax.base)),
        internal_grand_total: emits_use_tax
            .then(|| format_q2(round_q2(customer_grand_total + parts.use_tax.amount))),

        adjustments,
        rejected: parts.rejected,
        jurisdiction_taxes: parts.retail.jurisdictions,

        subtotal_q7: format_q7(parts.subtotal),
        taxable_base_q7: format_q7(parts.taxable_base),
        non_taxable_base_q7: format_q7(parts.non_taxable_base),
        modifier_total_q7: format_q7(modifier_total),
        retail_tax_q7: format_q7(parts.retail.amount),
        use_tax_q7: emits_use_tax.then(|| format_q7(parts.use_tax.amount)),
        customer_grand_total_q7: format_q7(customer_grand_total_q7),

        checksum: String::new(),
    };

    result.checksum = checksum_of(&result);
    result
}

/// The checksum preimage is the canonical encoding of the result with
/// the checksum field removed.
pub fn checksum_of(result: &CalculationResult) -> String {
    let mut value = serde_json::to_value(result).expect("result serialization is infallible");
    if let Some(map) = value.as_object_mut() {
        map.remove("checksum");
    }
    fingerprint(&value)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::compute;
    use crate::types::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn input() -> FrozenInput {
        FrozenInput {
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
        }
    }

    #[test]
    fn test_checksum_matches_recomputation() {
        let result = compute(&input()).unwrap();
        assert_eq!(result.checksum, checksum_of(&result));
        assert_eq!(result.checksum.len(), 64);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut result = compute(&input()).unwrap();
        result.customer_grand_total = "999.99".into();
        assert_ne!(result.checksum, checksum_of(&result));
    }

    #[test]
    fn test_round_trip_preserves_checksum() {
        // Serialising and re-parsing a result must not change its
        // checksum: every monetary field is already a string.
        let result = compute(&input()).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        let back: CalculationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.checksum, checksum_of(&back));
        assert_eq!(back, result);
    }
}
