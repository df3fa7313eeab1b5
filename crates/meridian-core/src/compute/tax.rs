//! # Tax Engine
//!
//! Computes retail tax and use tax with strict segregation of taxable
//! and non-taxable bases.
//!
//! - **Retail tax** (modes RETAIL, MIXED): charged on the taxable base -
//!   the taxable subtotal plus the taxable share of pre-tax adjustments.
//!   With jurisdictions, each contributes `round₇(base × rate)` in
//!   `(order, code)` order and the contributions sum; without, a single
//!   flat rate applies.
//! - **Use tax** (modes USE_TAX, MIXED): an internal liability on the
//!   cost basis of lines the vendor did not already tax
//!   (`use_tax_eligible ∧ ¬vendor_tax_collected`). Never part of the
//!   customer total.

use rust_decimal::Decimal;

use crate::decimal::round_q7;
use crate::types::{JurisdictionTax, LineItem, TaxConfig};

/// Retail tax outcome.
#[derive(Debug, Clone)]
pub struct RetailTax {
    /// Q7 total retail tax.
    pub amount: Decimal,
    /// Per-jurisdiction sub-taxes, in application order. Empty when a
    /// flat rate was used.
    pub jurisdictions: Vec<JurisdictionTax>,
}

/// Computes retail tax on the taxable base.
pub fn retail_tax(taxable_base: Decimal, config: &TaxConfig) -> RetailTax {
    if !config.mode.retail() || taxable_base.is_zero() {
        return RetailTax {
            amount: Decimal::ZERO,
            jurisdictions: Vec::new(),
        };
    }

    if config.jurisdictions.is_empty() {
        return RetailTax {
            amount: round_q7(taxable_base * config.retail_rate),
            jurisdictions: Vec::new(),
        };
    }

    let mut ordered = config.jurisdictions.clone();
    ordered.sort_by(|a, b| (a.order, a.code.as_str()).cmp(&(b.order, b.code.as_str())));

    let mut total = Decimal::ZERO;
    let mut sub_taxes = Vec::with_capacity(ordered.len());
    for jurisdiction in &ordered {
        let amount = round_q7(taxable_base * jurisdiction.rate);
        total += amount;
        sub_taxes.push(JurisdictionTax {
            code: jurisdiction.code.clone(),
            rate: jurisdiction.rate.normalize().to_string(),
            amount: crate::decimal::format_q2(amount),
            amount_q7: crate::decimal::format_q7(amount),
        });
    }

    RetailTax {
        amount: total,
        jurisdictions: sub_taxes,
    }
}

/// Use tax outcome.
#[derive(Debug, Clone)]
pub struct UseTax {
    /// Q7 cost basis the tax applies to.
    pub base: Decimal,
    /// Q7 use tax.
    pub amount: Decimal,
}

/// Computes use tax over the eligible cost basis.
pub fn use_tax(items: &[LineItem], config: &TaxConfig) -> UseTax {
    if !config.mode.use_tax() {
        return UseTax {
            base: Decimal::ZERO,
            amount: Decimal::ZERO,
        };
    }

    let base: Decimal = items
        .iter()
        .filter(|item| item.use_tax_eligible && !item.vendor_tax_collected)
        .map(|item| round_q7(item.cost.unwrap_or(Decimal::ZERO) * item.quantity))
        .sum();

    UseTax {
        base,
        amount: round_q7(base * config.use_tax_rate),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Jurisdiction, TaxMode, TaxSetting};
    use rust_decimal_macros::dec;

    fn config(mode: TaxMode) -> TaxConfig {
        TaxConfig {
            mode,
            retail_rate: dec!(0.10),
            use_tax_rate: dec!(0.08),
            jurisdictions: vec![],
            schema_version: "1".into(),
        }
    }

    fn line(cost: Decimal, qty: Decimal, eligible: bool, vendor_collected: bool) -> LineItem {
        LineItem {
            id: "a".into(),
            unit_price: dec!(0),
            quantity: qty,
            cost: Some(cost),
            tax_setting: TaxSetting::Taxable,
            use_tax_eligible: eligible,
            vendor_tax_collected: vendor_collected,
        }
    }

    #[test]
    fn test_flat_retail_tax() {
        let tax = retail_tax(dec!(200), &config(TaxMode::Retail));
        assert_eq!(tax.amount, dec!(20));
        assert!(tax.jurisdictions.is_empty());
    }

    #[test]
    fn test_zero_base_zero_tax() {
        let tax = retail_tax(dec!(0), &config(TaxMode::Retail));
        assert_eq!(tax.amount, dec!(0));
    }

    #[test]
    fn test_use_tax_mode_skips_retail() {
        let tax = retail_tax(dec!(200), &config(TaxMode::UseTax));
        assert_eq!(tax.amount, dec!(0));
    }

    #[test]
    fn test_jurisdictions_sorted_and_summed() {
        let mut cfg = config(TaxMode::Retail);
        cfg.jurisdictions = vec![
            Jurisdiction { code: "CITY".into(), order: 2, rate: dec!(0.01) },
            Jurisdiction { code: "STATE".into(), order: 1, rate: dec!(0.0625) },
            Jurisdiction { code: "COUNTY".into(), order: 2, rate: dec!(0.005) },
        ];
        let tax = retail_tax(dec!(1000), &cfg);

        let codes: Vec<_> = tax.jurisdictions.iter().map(|j| j.code.as_str()).collect();
        assert_eq!(codes, vec!["STATE", "CITY", "COUNTY"]);
        assert_eq!(tax.amount, dec!(62.5) + dec!(10) + dec!(5));
    }

    #[test]
    fn test_use_tax_eligibility() {
        let items = vec![
            line(dec!(1000), dec!(1), true, false),
            line(dec!(500), dec!(2), true, true),   // vendor already taxed
            line(dec!(300), dec!(1), false, false), // not eligible
        ];
        let tax = use_tax(&items, &config(TaxMode::UseTax));
        assert_eq!(tax.base, dec!(1000));
        assert_eq!(tax.amount, dec!(80));
    }

    #[test]
    fn test_use_tax_only_in_use_modes() {
        let items = vec![line(dec!(1000), dec!(1), true, false)];
        assert_eq!(use_tax(&items, &config(TaxMode::Retail)).amount, dec!(0));
        assert_eq!(use_tax(&items, &config(TaxMode::Mixed)).amount, dec!(80));
    }
}
