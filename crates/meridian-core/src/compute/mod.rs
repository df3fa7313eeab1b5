//! # The Pure Compute Stage
//!
//! `compute(frozen_input) → CalculationResult`. No I/O, no clocks, no
//! randomness, no mutation of inputs. Same bytes in, same bytes out.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   1. Validation floor        counts, ceilings, duplicates, schema      │
//! │   2. Base subtotal           Σ round₇(price × qty), partitioned        │
//! │   3. Eligibility             tax-setting resolution, dependency DAG,   │
//! │                              rule filtering (graph.rs)                 │
//! │   4. Grouping + ordering     8-attribute keys, deterministic order     │
//! │                              (grouping.rs)                             │
//! │   5. Pre-tax application     running ledger, per-line allocations      │
//! │                              (apply.rs)                                │
//! │   6. Taxes                   retail on the taxable base, use tax on    │
//! │                              the cost basis (tax.rs)                   │
//! │   7. Post-tax application    same machinery, tax base untouched       │
//! │   8. Result + checksum       Q2/Q7 strings, SHA-256 over canonical     │
//! │                              encoding (result.rs)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failure semantics: deterministic, and never partial - an error means
//! no result at all.

pub mod apply;
pub mod graph;
pub mod grouping;
pub mod result;
pub mod tax;

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::error::CoreResult;
use crate::rules::RuleValue;
use crate::types::{ApplicationType, CalculationResult, FrozenInput};
use crate::validate::{validate_floor, ComputeLimits};

use apply::{apply_group, AppliedGroup, Ledger};
use grouping::{group_modifiers, ModifierGroup};

/// Computes a result with the default limits.
pub fn compute(input: &FrozenInput) -> CoreResult<CalculationResult> {
    compute_with_limits(input, &ComputeLimits::default())
}

/// Computes a result with explicit resource limits.
pub fn compute_with_limits(
    input: &FrozenInput,
    limits: &ComputeLimits,
) -> CoreResult<CalculationResult> {
    validate_floor(input, limits)?;

    let mut ledger = Ledger::from_items(&input.line_items);
    let subtotal = ledger.total;
    let taxable_subtotal = ledger.taxable;
    let non_taxable_subtotal = ledger.non_taxable;

    let context = build_context(input, subtotal, taxable_subtotal, non_taxable_subtotal);
    let (accepted, rejected) = graph::resolve_modifiers(input, &context)?;
    let groups = group_modifiers(accepted, limits.max_groups)?;

    let mut applied: Vec<(ModifierGroup, AppliedGroup)> = Vec::with_capacity(groups.len());
    let (pre_tax, post_tax): (Vec<_>, Vec<_>) = groups
        .into_iter()
        .partition(|g| g.key.application_type == ApplicationType::PreTax);

    for group in pre_tax {
        let outcome = apply_group(&mut ledger, &group)?;
        applied.push((group, outcome));
    }

    // The tax base is fixed here; post-tax groups never re-open it.
    let taxable_base = ledger.taxable;
    let non_taxable_base = ledger.non_taxable;
    let retail = tax::retail_tax(taxable_base, &input.tax_config);
    let use_tax = tax::use_tax(&input.line_items, &input.tax_config);

    for group in post_tax {
        let outcome = apply_group(&mut ledger, &group)?;
        applied.push((group, outcome));
    }

    Ok(result::build(result::ResultParts {
        input,
        subtotal,
        taxable_base,
        non_taxable_base,
        running_total: ledger.total,
        applied,
        rejected,
        retail,
        use_tax,
    }))
}

// =============================================================================
// Rule Evaluation Context
// =============================================================================

/// Builds the read-only context rules evaluate against: the base
/// subtotal, computed aggregates, the line-items array, and the
/// pass-through proposal/customer/project metadata.
fn build_context(
    input: &FrozenInput,
    subtotal: Decimal,
    taxable_subtotal: Decimal,
    non_taxable_subtotal: Decimal,
) -> RuleValue {
    let mut root: BTreeMap<String, RuleValue> = BTreeMap::new();

    // Pass-through seed first; computed keys below override on clash.
    if let RuleValue::Map(seed) = RuleValue::from_json(&input.context_seed) {
        root.extend(seed);
    }

    let mut proposal = match root.remove("proposal") {
        Some(RuleValue::Map(map)) => map,
        _ => BTreeMap::new(),
    };
    proposal.insert("id".into(), RuleValue::Text(input.proposal_id.clone()));
    if let Some(tenant) = &input.tenant {
        proposal.insert("tenant".into(), RuleValue::Text(tenant.clone()));
    }
    root.insert("proposal".into(), RuleValue::Map(proposal));

    let computed: BTreeMap<String, RuleValue> = [
        ("subtotal".to_string(), RuleValue::Number(subtotal)),
        ("taxableSubtotal".to_string(), RuleValue::Number(taxable_subtotal)),
        ("nonTaxableSubtotal".to_string(), RuleValue::Number(non_taxable_subtotal)),
        (
            "lineItemCount".to_string(),
            RuleValue::Number(Decimal::from(input.line_items.len() as i64)),
        ),
        (
            "modifierCount".to_string(),
            RuleValue::Number(Decimal::from(input.modifiers.len() as i64)),
        ),
    ]
    .into_iter()
    .collect();
    root.insert("computed".into(), RuleValue::Map(computed));

    root.insert(
        "running".into(),
        RuleValue::Map(
            [("total".to_string(), RuleValue::Number(subtotal))]
                .into_iter()
                .collect(),
        ),
    );

    let mut eval_ctx = match root.remove("evaluationContext") {
        Some(RuleValue::Map(map)) => map,
        _ => BTreeMap::new(),
    };
    eval_ctx.insert(
        "lineItems".into(),
        RuleValue::List(
            input
                .line_items
                .iter()
                .map(|item| {
                    RuleValue::Map(
                        [
                            ("id".to_string(), RuleValue::Text(item.id.clone())),
                            ("unitPrice".to_string(), RuleValue::Number(item.unit_price)),
                            ("quantity".to_string(), RuleValue::Number(item.quantity)),
                            (
                                "taxSetting".to_string(),
                                RuleValue::Text(item.tax_setting.as_str().to_string()),
                            ),
                        ]
                        .into_iter()
                        .collect(),
                    )
                })
                .collect(),
        ),
    );
    root.insert("evaluationContext".into(), RuleValue::Map(eval_ctx));

    RuleValue::Map(root)
}

// =============================================================================
// Unit Tests
// =============================================================================
