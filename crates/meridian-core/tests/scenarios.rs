//! End-to-end pricing scenarios against the pure compute stage.
//!
//! Each scenario fixes concrete customer-facing numbers; together they
//! pin down the semantics of percentage, fixed, and margin groups, tax
//! segregation, dependency exclusion, and use-tax mode.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use meridian_core::compute;
use meridian_core::types::*;

// =============================================================================
// Builders
// =============================================================================

fn line(id: &str, unit_price: Decimal, quantity: Decimal, setting: TaxSetting) -> LineItem {
    LineItem {
        id: id.into(),
        unit_price,
        quantity,
        cost: None,
        tax_setting: setting,
        use_tax_eligible: false,
        vendor_tax_collected: false,
    }
}

fn modifier(id: &str, kind: ModifierKind, value: Decimal) -> Modifier {
    Modifier {
        id: id.into(),
        kind,
        value,
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
    }
}

fn retail_config(rate: Decimal) -> TaxConfig {
    TaxConfig {
        mode: TaxMode::Retail,
        retail_rate: rate,
        use_tax_rate: dec!(0),
        jurisdictions: vec![],
        schema_version: "1".into(),
    }
}

fn frozen(
    items: Vec<LineItem>,
    modifiers: Vec<Modifier>,
    dependencies: Vec<Dependency>,
    config: TaxConfig,
) -> FrozenInput {
    FrozenInput {
        proposal_id: "prop-1".into(),
        tenant: Some("acme".into()),
        schema_version: "1".into(),
        line_items: items,
        modifiers,
        dependencies,
        rules: vec![],
        tax_config: config,
        context_seed: json!({}),
        fingerprint: "fp".into(),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn simple_taxable_sale() {
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(2), TaxSetting::Taxable)],
        vec![],
        vec![],
        retail_config(dec!(0.10)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.subtotal, "200.00");
    assert_eq!(result.retail_tax, "20.00");
    assert_eq!(result.customer_grand_total, "220.00");
    assert_eq!(result.modifier_total, "0.00");
    assert!(result.adjustments.is_empty());
}

#[test]
fn percentage_discount() {
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(2), TaxSetting::Taxable)],
        vec![modifier("d", ModifierKind::Percentage, dec!(-15))],
        vec![],
        retail_config(dec!(0.10)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.modifier_total, "-30.00");
    assert_eq!(result.retail_tax, "17.00");
    assert_eq!(result.customer_grand_total, "187.00");
}

#[test]
fn mixed_tax_settings_with_post_tax_fee() {
    let mut fee = modifier("f", ModifierKind::Fixed, dec!(25.00));
    fee.application_type = ApplicationType::PostTax;
    fee.category = ModifierCategory::Fee;

    let input = frozen(
        vec![
            line("a", dec!(150.00), dec!(2), TaxSetting::Taxable),
            line("b", dec!(75.00), dec!(3), TaxSetting::NonTaxable),
        ],
        vec![modifier("d", ModifierKind::Percentage, dec!(-10)), fee],
        vec![],
        retail_config(dec!(0.0875)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.subtotal, "525.00");
    // The 10% discount takes 52.50 off the whole base; its taxable share
    // (10% of 300) leaves a 270.00 taxable base.
    assert_eq!(result.taxable_base_q7, "270.0000000");
    assert_eq!(result.retail_tax, "23.63");
    // round₂(525 − 52.50 + 23.625 + 25) = 521.13
    assert_eq!(result.customer_grand_total, "521.13");
    assert_eq!(result.modifier_total, "-27.50");
}

#[test]
fn margin_modifier_reprices_to_target() {
    let mut item = line("a", dec!(100.00), dec!(1), TaxSetting::Taxable);
    item.cost = Some(dec!(60.00));

    let mut margin = modifier("g", ModifierKind::Margin, dec!(50));
    margin.category = ModifierCategory::Adjustment;

    let input = frozen(vec![item], vec![margin], vec![], retail_config(dec!(0)));
    let result = compute(&input).unwrap();

    // cost 60 at 50% margin => new unit price 120.0000000
    assert_eq!(result.adjustments.len(), 1);
    assert_eq!(result.adjustments[0].amount, "20.00");
    assert_eq!(result.adjustments[0].per_line_allocations[0].amount_q7, "20.0000000");
    assert_eq!(result.customer_grand_total, "120.00");
}

#[test]
fn dependency_exclusion_first_accepted_wins() {
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(1), TaxSetting::Taxable)],
        vec![
            modifier("m1", ModifierKind::Percentage, dec!(-5)),
            modifier("m2", ModifierKind::Percentage, dec!(-10)),
        ],
        vec![Dependency {
            modifier_id: "m2".into(),
            depends_on: "m1".into(),
            dependency_type: DependencyType::Excludes,
        }],
        retail_config(dec!(0)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.adjustments.len(), 1);
    assert_eq!(result.adjustments[0].modifier_ids, vec!["m1"]);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].id, "m2");
    assert_eq!(result.rejected[0].reason, "excluded_by:m1");
}

#[test]
fn use_tax_mode_keeps_customer_total_clean() {
    let mut item = line("a", dec!(0.00), dec!(1), TaxSetting::Taxable);
    item.cost = Some(dec!(1000.00));
    item.use_tax_eligible = true;

    let config = TaxConfig {
        mode: TaxMode::UseTax,
        retail_rate: dec!(0),
        use_tax_rate: dec!(0.08),
        jurisdictions: vec![],
        schema_version: "1".into(),
    };
    let result = compute(&frozen(vec![item], vec![], vec![], config)).unwrap();

    assert_eq!(result.use_tax_base.as_deref(), Some("1000.00"));
    assert_eq!(result.use_tax.as_deref(), Some("80.00"));
    assert_eq!(result.customer_grand_total, "0.00");
    assert_eq!(result.internal_grand_total.as_deref(), Some("80.00"));
}

// =============================================================================
// Further coverage
// =============================================================================

#[test]
fn jurisdictions_report_sub_taxes() {
    let config = TaxConfig {
        mode: TaxMode::Retail,
        retail_rate: dec!(0.10),
        use_tax_rate: dec!(0),
        jurisdictions: vec![
            Jurisdiction { code: "CITY".into(), order: 2, rate: dec!(0.02) },
            Jurisdiction { code: "STATE".into(), order: 1, rate: dec!(0.0625) },
        ],
        schema_version: "1".into(),
    };
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(10), TaxSetting::Taxable)],
        vec![],
        vec![],
        config,
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.jurisdiction_taxes.len(), 2);
    assert_eq!(result.jurisdiction_taxes[0].code, "STATE");
    assert_eq!(result.jurisdiction_taxes[0].amount, "62.50");
    assert_eq!(result.jurisdiction_taxes[1].code, "CITY");
    assert_eq!(result.jurisdiction_taxes[1].amount, "20.00");
    assert_eq!(result.retail_tax, "82.50");
}

#[test]
fn two_equal_discounts_collapse_into_one_group() {
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(1), TaxSetting::Taxable)],
        vec![
            modifier("m1", ModifierKind::Percentage, dec!(-5)),
            modifier("m2", ModifierKind::Percentage, dec!(-5)),
        ],
        vec![],
        retail_config(dec!(0)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.adjustments.len(), 1);
    assert_eq!(result.adjustments[0].combined_value, "-10");
    assert_eq!(result.adjustments[0].amount, "-10.00");
    assert_eq!(result.customer_grand_total, "90.00");
}

#[test]
fn inherit_from_line_item_controls_tax_base() {
    // Discount pinned to the non-taxable line inherits NON_TAXABLE and
    // leaves the taxable base alone.
    let mut discount = modifier("d", ModifierKind::Percentage, dec!(-10));
    discount.line_item_id = Some("b".into());

    let input = frozen(
        vec![
            line("a", dec!(100.00), dec!(1), TaxSetting::Taxable),
            line("b", dec!(100.00), dec!(1), TaxSetting::NonTaxable),
        ],
        vec![discount],
        vec![],
        retail_config(dec!(0.10)),
    );
    let result = compute(&input).unwrap();

    assert_eq!(result.taxable_base_q7, "100.0000000");
    assert_eq!(result.retail_tax, "10.00");
    assert_eq!(result.modifier_total, "-20.00");
}

#[test]
fn duplicate_modifier_ids_rejected() {
    let input = frozen(
        vec![line("a", dec!(100.00), dec!(1), TaxSetting::Taxable)],
        vec![
            modifier("d", ModifierKind::Percentage, dec!(-5)),
            modifier("d", ModifierKind::Percentage, dec!(-10)),
        ],
        vec![],
        retail_config(dec!(0)),
    );
    let err = compute(&input).unwrap_err();
    assert_eq!(err.kind(), "INVALID_INPUT");
}

#[test]
fn identical_inputs_identical_checksums() {
    let build = || {
        frozen(
            vec![
                line("a", dec!(150.00), dec!(2), TaxSetting::Taxable),
                line("b", dec!(75.00), dec!(3), TaxSetting::NonTaxable),
            ],
            vec![modifier("d", ModifierKind::Percentage, dec!(-10))],
            vec![],
            retail_config(dec!(0.0875)),
        )
    };
    let first = compute(&build()).unwrap();
    let second = compute(&build()).unwrap();
    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first, second);
}
