//! # Group Application
//!
//! Applies ordered modifier groups to the running ledger.
//!
//! ## The Ledger
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Ledger (all Q7)                                                        │
//! │                                                                         │
//! │  per line:   running amount  (starts at round₇(unit_price × qty))      │
//! │  totals:     running total, taxable partition, non-taxable partition   │
//! │                                                                         │
//! │  Every group application produces:                                      │
//! │    amount          the group's total adjustment                         │
//! │    deltas          how the two partitions move                          │
//! │    allocations     per-line shares that sum EXACTLY to the amount      │
//! │                                                                         │
//! │  Allocation: proportional first pass at Q7, then the rounding          │
//! │  residual is pinned onto the LAST allocation so the sum closes.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Percentage semantics: the rate applies to the full running subtotal;
//! a taxable-resolved group moves `round₇(running_taxable × rate)` out of
//! the taxable partition and the remainder out of the non-taxable
//! partition; a non-taxable-resolved group charges the non-taxable
//! partition only. Fixed amounts land whole in their resolved partition.
//! Margin deltas land in each repriced line's own partition.

use rust_decimal::Decimal;

use crate::decimal::round_q7;
use crate::error::{CoreError, CoreResult, Violation};
use crate::types::{LineItem, MissingCostStrategy, ModifierKind, TaxSetting};

use super::grouping::ModifierGroup;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// =============================================================================
// Ledger
// =============================================================================

/// Per-line running state.
#[derive(Debug, Clone)]
pub struct LineState {
    pub id: String,
    pub quantity: Decimal,
    pub tax_setting: TaxSetting,
    pub cost: Option<Decimal>,
    /// Q7 running amount for this line.
    pub running: Decimal,
}

/// The running totals a computation carries through group application.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub lines: Vec<LineState>,
    pub total: Decimal,
    pub taxable: Decimal,
    pub non_taxable: Decimal,
}

impl Ledger {
    /// Seeds the ledger from line items: each line starts at
    /// `round₇(unit_price × quantity)`, partitioned by tax setting.
    pub fn from_items(items: &[LineItem]) -> Ledger {
        let mut lines = Vec::with_capacity(items.len());
        let mut taxable = Decimal::ZERO;
        let mut non_taxable = Decimal::ZERO;

        for item in items {
            let amount = round_q7(item.unit_price * item.quantity);
            match item.tax_setting {
                TaxSetting::Taxable => taxable += amount,
                TaxSetting::NonTaxable => non_taxable += amount,
            }
            lines.push(LineState {
                id: item.id.clone(),
                quantity: item.quantity,
                tax_setting: item.tax_setting,
                cost: item.cost,
                running: amount,
            });
        }

        Ledger {
            lines,
            total: taxable + non_taxable,
            taxable,
            non_taxable,
        }
    }
}

// =============================================================================
// Applied Group
// =============================================================================

/// The outcome of applying one group.
#[derive(Debug, Clone)]
pub struct AppliedGroup {
    /// Q7 total adjustment.
    pub amount: Decimal,
    /// Q7 movement of the taxable partition.
    pub taxable_delta: Decimal,
    /// Q7 movement of the non-taxable partition.
    pub non_taxable_delta: Decimal,
    /// Per-line shares, summing exactly to `amount`.
    pub allocations: Vec<(String, Decimal)>,
}

/// Applies one group to the ledger, mutating running amounts and
/// returning the applied record.
pub fn apply_group(ledger: &mut Ledger, group: &ModifierGroup) -> CoreResult<AppliedGroup> {
    let applied = match group.key.kind {
        ModifierKind::Percentage => apply_percentage(ledger, group),
        ModifierKind::Fixed => apply_fixed(ledger, group),
        ModifierKind::Margin => apply_margin(ledger, group)?,
    };

    for (line_id, share) in &applied.allocations {
        if let Some(line) = ledger.lines.iter_mut().find(|l| &l.id == line_id) {
            line.running += *share;
        }
    }
    ledger.taxable += applied.taxable_delta;
    ledger.non_taxable += applied.non_taxable_delta;
    ledger.total += applied.amount;

    Ok(applied)
}

// =============================================================================
// Percentage
// =============================================================================

fn apply_percentage(ledger: &Ledger, group: &ModifierGroup) -> AppliedGroup {
    let rate = group.combined_value / HUNDRED;
    let amount = round_q7(ledger.total * rate);

    let (taxable_delta, non_taxable_delta) = match group.key.tax_setting {
        TaxSetting::Taxable => {
            let taxable = round_q7(ledger.taxable * rate);
            (taxable, amount - taxable)
        }
        TaxSetting::NonTaxable => (Decimal::ZERO, amount),
    };

    let mut allocations = allocate_partition(ledger, TaxSetting::Taxable, taxable_delta);
    allocations.extend(allocate_partition(ledger, TaxSetting::NonTaxable, non_taxable_delta));

    AppliedGroup {
        amount,
        taxable_delta,
        non_taxable_delta,
        allocations,
    }
}

// =============================================================================
// Fixed
// =============================================================================

fn apply_fixed(ledger: &Ledger, group: &ModifierGroup) -> AppliedGroup {
    let amount = round_q7(group.combined_value);

    let (taxable_delta, non_taxable_delta) = match group.key.tax_setting {
        TaxSetting::Taxable => (amount, Decimal::ZERO),
        TaxSetting::NonTaxable => (Decimal::ZERO, amount),
    };

    let allocations = allocate_partition(ledger, group.key.tax_setting, amount);

    AppliedGroup {
        amount,
        taxable_delta,
        non_taxable_delta,
        allocations,
    }
}

// =============================================================================
// Margin
// =============================================================================

fn apply_margin(ledger: &Ledger, group: &ModifierGroup) -> CoreResult<AppliedGroup> {
    let first = &group.members[0].modifier;
    let margin = group.combined_value / HUNDRED;
    if margin.is_sign_negative() || margin >= Decimal::ONE {
        return Err(CoreError::InvalidMargin {
            modifier_id: first.id.clone(),
            value: group.combined_value.normalize().to_string(),
        });
    }

    // A pinned modifier reprices only its line; an unpinned group
    // reprices every line.
    let targets: Vec<&str> = group
        .members
        .iter()
        .filter_map(|m| m.modifier.line_item_id.as_deref())
        .collect();

    let mut amount = Decimal::ZERO;
    let mut taxable_delta = Decimal::ZERO;
    let mut non_taxable_delta = Decimal::ZERO;
    let mut allocations = Vec::new();

    for line in &ledger.lines {
        if !targets.is_empty() && !targets.contains(&line.id.as_str()) {
            continue;
        }
        if line.quantity.is_zero() {
            continue;
        }

        let current_price = line.running / line.quantity;
        let cost = match line.cost {
            Some(cost) => cost,
            None => match first.missing_cost_strategy {
                MissingCostStrategy::Skip => continue,
                MissingCostStrategy::UseDefault => {
                    let pct = group.key.cost_percentage.ok_or_else(|| {
                        CoreError::InvalidInput(vec![Violation::new(
                            format!("modifiers.{}.costPercentage", first.id),
                            "USE_DEFAULT strategy requires costPercentage",
                        )])
                    })?;
                    round_q7(current_price * pct / HUNDRED)
                }
                MissingCostStrategy::Fail => {
                    return Err(CoreError::InvalidInput(vec![Violation::new(
                        format!("lineItems.{}.cost", line.id),
                        format!("margin modifier '{}' requires a cost", first.id),
                    )]));
                }
            },
        };

        let new_price = cost / (Decimal::ONE - margin);
        let adjustment = round_q7((new_price - current_price) * line.quantity);

        match line.tax_setting {
            TaxSetting::Taxable => taxable_delta += adjustment,
            TaxSetting::NonTaxable => non_taxable_delta += adjustment,
        }
        amount += adjustment;
        allocations.push((line.id.clone(), adjustment));
    }

    Ok(AppliedGroup {
        amount,
        taxable_delta,
        non_taxable_delta,
        allocations,
    })
}

// =============================================================================
// Proportional Allocation
// =============================================================================

/// Allocates `amount` over the lines of `partition` by their share of
/// the partition's running base. First pass rounds each share to Q7;
/// the rounding residual is pinned onto the last allocation so the
/// shares sum exactly to `amount`.
///
/// A zero base degenerates to "everything on the last line" (first-pass
/// shares are all zero, the residual is the whole amount). An empty
/// partition falls back to the last line of the ledger.
fn allocate_partition(
    ledger: &Ledger,
    partition: TaxSetting,
    amount: Decimal,
) -> Vec<(String, Decimal)> {
    if amount.is_zero() {
        return Vec::new();
    }

    let members: Vec<&LineState> = ledger
        .lines
        .iter()
        .filter(|l| l.tax_setting == partition)
        .collect();

    if members.is_empty() {
        return match ledger.lines.last() {
            Some(last) => vec![(last.id.clone(), amount)],
            None => Vec::new(),
        };
    }

    let base: Decimal = members.iter().map(|l| l.running).sum();
    let mut allocations: Vec<(String, Decimal)> = Vec::with_capacity(members.len());
    let mut allocated = Decimal::ZERO;

    for line in &members {
        let share = if base.is_zero() {
            Decimal::ZERO
        } else {
            round_q7(amount * line.running / base)
        };
        allocated += share;
        allocations.push((line.id.clone(), share));
    }

    let residual = amount - allocated;
    if !residual.is_zero() {
        if let Some(last) = allocations.last_mut() {
            last.1 += residual;
        }
    }

    allocations
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::graph::ResolvedModifier;
    use crate::compute::grouping::group_modifiers;
    use crate::types::*;
    use rust_decimal_macros::dec;

    fn item(id: &str, price: Decimal, qty: Decimal, setting: TaxSetting) -> LineItem {
        LineItem {
            id: id.into(),
            unit_price: price,
            quantity: qty,
            cost: None,
            tax_setting: setting,
            use_tax_eligible: false,
            vendor_tax_collected: false,
        }
    }

    fn resolved(
        id: &str,
        kind: ModifierKind,
        value: Decimal,
        setting: TaxSetting,
    ) -> ResolvedModifier {
        ResolvedModifier {
            modifier: Modifier {
                id: id.into(),
                kind,
                value,
                tax_setting: ModifierTaxSetting::Taxable,
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
            },
            tax_setting: setting,
        }
    }

    fn single_group(r: ResolvedModifier) -> ModifierGroup {
        group_modifiers(vec![r], 100).unwrap().remove(0)
    }

    #[test]
    fn test_percentage_splits_partitions() {
        // 150×2 taxable + 75×3 non-taxable; -10% on the full base.
        let mut ledger = Ledger::from_items(&[
            item("a", dec!(150), dec!(2), TaxSetting::Taxable),
            item("b", dec!(75), dec!(3), TaxSetting::NonTaxable),
        ]);
        let group = single_group(resolved(
            "d",
            ModifierKind::Percentage,
            dec!(-10),
            TaxSetting::Taxable,
        ));

        let applied = apply_group(&mut ledger, &group).unwrap();
        assert_eq!(applied.amount, dec!(-52.5));
        assert_eq!(applied.taxable_delta, dec!(-30));
        assert_eq!(applied.non_taxable_delta, dec!(-22.5));
        assert_eq!(ledger.taxable, dec!(270));
        assert_eq!(ledger.non_taxable, dec!(202.5));
        assert_eq!(ledger.total, dec!(472.5));
    }

    #[test]
    fn test_non_taxable_percentage_leaves_taxable_base() {
        let mut ledger = Ledger::from_items(&[
            item("a", dec!(100), dec!(1), TaxSetting::Taxable),
            item("b", dec!(100), dec!(1), TaxSetting::NonTaxable),
        ]);
        let group = single_group(resolved(
            "d",
            ModifierKind::Percentage,
            dec!(-10),
            TaxSetting::NonTaxable,
        ));

        let applied = apply_group(&mut ledger, &group).unwrap();
        assert_eq!(applied.amount, dec!(-20));
        assert_eq!(applied.taxable_delta, dec!(0));
        assert_eq!(ledger.taxable, dec!(100));
        assert_eq!(ledger.non_taxable, dec!(80));
    }

    #[test]
    fn test_fixed_allocation_closes_exactly() {
        // 10.00 over three equal lines: 3.3333333 + 3.3333333 + residual.
        let mut ledger = Ledger::from_items(&[
            item("a", dec!(1), dec!(1), TaxSetting::Taxable),
            item("b", dec!(1), dec!(1), TaxSetting::Taxable),
            item("c", dec!(1), dec!(1), TaxSetting::Taxable),
        ]);
        let group = single_group(resolved(
            "f",
            ModifierKind::Fixed,
            dec!(10),
            TaxSetting::Taxable,
        ));

        let applied = apply_group(&mut ledger, &group).unwrap();
        let total: Decimal = applied.allocations.iter().map(|(_, a)| *a).sum();
        assert_eq!(total, dec!(10));
        assert_eq!(applied.allocations[0].1, dec!(3.3333333));
        assert_eq!(applied.allocations[1].1, dec!(3.3333333));
        assert_eq!(applied.allocations[2].1, dec!(3.3333334));
    }

    #[test]
    fn test_fixed_zero_base_goes_to_last_line() {
        let mut ledger = Ledger::from_items(&[
            item("a", dec!(0), dec!(1), TaxSetting::Taxable),
            item("b", dec!(0), dec!(1), TaxSetting::Taxable),
        ]);
        let group = single_group(resolved(
            "f",
            ModifierKind::Fixed,
            dec!(25),
            TaxSetting::Taxable,
        ));
        let applied = apply_group(&mut ledger, &group).unwrap();
        assert_eq!(applied.allocations, vec![
            ("a".to_string(), dec!(0)),
            ("b".to_string(), dec!(25)),
        ]);
    }

    #[test]
    fn test_margin_reprices_line() {
        // 100×1 at cost 60, target margin 50% => new price 120, adj +20.
        let mut items = vec![item("a", dec!(100), dec!(1), TaxSetting::Taxable)];
        items[0].cost = Some(dec!(60));
        let mut ledger = Ledger::from_items(&items);
        let group = single_group(resolved(
            "g",
            ModifierKind::Margin,
            dec!(50),
            TaxSetting::Taxable,
        ));

        let applied = apply_group(&mut ledger, &group).unwrap();
        assert_eq!(applied.amount, dec!(20));
        assert_eq!(ledger.total, dec!(120));
        assert_eq!(ledger.lines[0].running, dec!(120));
    }

    #[test]
    fn test_margin_rejects_out_of_range() {
        let mut ledger = Ledger::from_items(&[item("a", dec!(100), dec!(1), TaxSetting::Taxable)]);
        for bad in [dec!(100), dec!(150), dec!(-5)] {
            let group = single_group(resolved("g", ModifierKind::Margin, bad, TaxSetting::Taxable));
            let err = apply_group(&mut ledger, &group).unwrap_err();
            assert_eq!(err.kind(), "INVALID_MARGIN");
        }
    }

    #[test]
    fn test_margin_missing_cost_skip_and_fail() {
        let mut ledger = Ledger::from_items(&[item("a", dec!(100), dec!(1), TaxSetting::Taxable)]);

        let group = single_group(resolved("g", ModifierKind::Margin, dec!(50), TaxSetting::Taxable));
        let applied = apply_group(&mut ledger, &group).unwrap();
        assert_eq!(applied.amount, dec!(0));

        let mut failing = resolved("g", ModifierKind::Margin, dec!(50), TaxSetting::Taxable);
        failing.modifier.missing_cost_strategy = MissingCostStrategy::Fail;
        let err = apply_group(&mut ledger, &single_group(failing)).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[test]
    fn test_margin_use_default_cost() {
        // cost = 40% of current price 100 = 40; margin 50% => price 80.
        let mut ledger = Ledger::from_items(&[item("a", dec!(100), dec!(1), TaxSetting::Taxable)]);
        let mut r = resolved("g", ModifierKind::Margin, dec!(50), TaxSetting::Taxable);
        r.modifier.missing_cost_strategy = MissingCostStrategy::UseDefault;
        r.modifier.cost_percentage = Some(dec!(40));
        let applied = apply_group(&mut ledger, &single_group(r)).unwrap();
        assert_eq!(applied.amount, dec!(-20));
        assert_eq!(ledger.total, dec!(80));
    }
}
