//! # Modifier Eligibility
//!
//! Decides which modifiers participate in a computation, in three passes:
//!
//! 1. **Tax-setting resolution** - `inherit` resolves from the referenced
//!    line item, defaulting to taxable.
//! 2. **Dependency resolution** - the modifier DAG is topologically
//!    sorted (ties broken by `(chain_priority, id)`); `REQUIRES` drops
//!    modifiers whose target is absent or itself dropped; `EXCLUDES`
//!    keeps the first accepted modifier in topological order and marks
//!    the other `excluded_by:<winner>`.
//! 3. **Rule filtering** - each survivor's compiled rules are evaluated
//!    against the read-only context; a false tree discards the modifier
//!    (`rule_failed`); an evaluation error discards only that modifier
//!    (`rule_error`) and the computation proceeds.
//!
//! Every pass is deterministic, so the rejected list (with its reasons)
//! is part of the canonical result.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::rules::{evaluate, CompiledRule, RuleValue};
use crate::types::{
    Dependency, DependencyType, FrozenInput, Modifier, ModifierTaxSetting, RejectedModifier,
    TaxSetting,
};

/// A modifier admitted to grouping, with its tax setting resolved.
#[derive(Debug, Clone)]
pub struct ResolvedModifier {
    pub modifier: Modifier,
    pub tax_setting: TaxSetting,
}

// =============================================================================
// Tax-Setting Resolution
// =============================================================================

/// Resolves a modifier's tax setting against the line items.
pub fn resolve_tax_setting(modifier: &Modifier, input: &FrozenInput) -> TaxSetting {
    match modifier.tax_setting {
        ModifierTaxSetting::Taxable => TaxSetting::Taxable,
        ModifierTaxSetting::NonTaxable => TaxSetting::NonTaxable,
        ModifierTaxSetting::Inherit => modifier
            .line_item_id
            .as_deref()
            .and_then(|id| input.line_items.iter().find(|item| item.id == id))
            .map(|item| item.tax_setting)
            .unwrap_or(TaxSetting::Taxable),
    }
}

// =============================================================================
// Dependency + Rule Resolution
// =============================================================================

/// Runs all three passes. Returns accepted modifiers in topological
/// order plus the rejected list.
pub fn resolve_modifiers(
    input: &FrozenInput,
    context: &RuleValue,
) -> CoreResult<(Vec<ResolvedModifier>, Vec<RejectedModifier>)> {
    let order = topological_order(&input.modifiers, &input.dependencies)?;

    let mut rules_by_modifier: BTreeMap<&str, Vec<&CompiledRule>> = BTreeMap::new();
    for rule in &input.rules {
        rules_by_modifier
            .entry(rule.modifier_id.as_str())
            .or_default()
            .push(rule);
    }

    let requires: Vec<&Dependency> = input
        .dependencies
        .iter()
        .filter(|d| d.dependency_type == DependencyType::Requires)
        .collect();
    let excludes: Vec<&Dependency> = input
        .dependencies
        .iter()
        .filter(|d| d.dependency_type == DependencyType::Excludes)
        .collect();

    let by_id: HashMap<&str, &Modifier> =
        input.modifiers.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut accepted: Vec<ResolvedModifier> = Vec::new();
    let mut accepted_ids: HashSet<String> = HashSet::new();
    let mut rejected: Vec<RejectedModifier> = Vec::new();
    let mut rejected_ids: HashSet<String> = HashSet::new();

    for id in &order {
        let modifier = by_id[id.as_str()];

        // REQUIRES: every target must exist and itself be accepted.
        let missing_requirement = requires.iter().any(|dep| {
            dep.modifier_id == *id
                && (!by_id.contains_key(dep.depends_on.as_str())
                    || rejected_ids.contains(&dep.depends_on)
                    || !accepted_ids.contains(&dep.depends_on))
        });
        if missing_requirement {
            rejected.push(RejectedModifier {
                id: id.clone(),
                reason: "missing_requirement".to_string(),
            });
            rejected_ids.insert(id.clone());
            continue;
        }

        // EXCLUDES: the first accepted endpoint of the edge wins.
        let excluded_by = excludes.iter().find_map(|dep| {
            let other = if dep.modifier_id == *id {
                &dep.depends_on
            } else if dep.depends_on == *id {
                &dep.modifier_id
            } else {
                return None;
            };
            accepted_ids.contains(other).then(|| other.clone())
        });
        if let Some(winner) = excluded_by {
            rejected.push(RejectedModifier {
                id: id.clone(),
                reason: format!("excluded_by:{winner}"),
            });
            rejected_ids.insert(id.clone());
            continue;
        }

        // Rules: all must hold. An eval error fails this modifier only.
        let mut verdict: Option<&'static str> = None;
        if let Some(rules) = rules_by_modifier.get(id.as_str()) {
            for rule in rules {
                match evaluate(rule, context) {
                    Ok(true) => {}
                    Ok(false) => {
                        verdict = Some("rule_failed");
                        break;
                    }
                    Err(_) => {
                        verdict = Some("rule_error");
                        break;
                    }
                }
            }
        }
        if let Some(reason) = verdict {
            rejected.push(RejectedModifier {
                id: id.clone(),
                reason: reason.to_string(),
            });
            rejected_ids.insert(id.clone());
            continue;
        }

        accepted.push(ResolvedModifier {
            modifier: modifier.clone(),
            tax_setting: resolve_tax_setting(modifier, input),
        });
        accepted_ids.insert(id.clone());
    }

    Ok((accepted, rejected))
}

// =============================================================================
// Topological Order
// =============================================================================

/// Kahn's algorithm over REQUIRES edges (target before dependent), with
/// `(chain_priority, id)` tie-breaks for determinism. Cycles are
/// `INVALID_INPUT`.
fn topological_order(
    modifiers: &[Modifier],
    dependencies: &[Dependency],
) -> CoreResult<Vec<String>> {
    let known: HashSet<&str> = modifiers.iter().map(|m| m.id.as_str()).collect();
    let priority: HashMap<&str, (i32, &str)> = modifiers
        .iter()
        .map(|m| (m.id.as_str(), (m.chain_priority, m.id.as_str())))
        .collect();

    // Edge target -> dependents. Edges to unknown targets do not
    // constrain ordering; the REQUIRES pass drops those dependents.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> = modifiers.iter().map(|m| (m.id.as_str(), 0)).collect();
    for dep in dependencies {
        if dep.dependency_type != DependencyType::Requires {
            continue;
        }
        if !known.contains(dep.depends_on.as_str()) || !known.contains(dep.modifier_id.as_str()) {
            continue;
        }
        dependents
            .entry(dep.depends_on.as_str())
            .or_default()
            .push(dep.modifier_id.as_str());
        *indegree.get_mut(dep.modifier_id.as_str()).unwrap() += 1;
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(modifiers.len());

    while !ready.is_empty() {
        // Smallest (chain_priority, id) first. Selection sort over the
        // ready set keeps this simple and deterministic.
        ready.sort_by_key(|id| priority[id]);
        let next = ready.remove(0);
        order.push(next.to_string());

        if let Some(list) = dependents.get(next) {
            for &dependent in list {
                let deg = indegree.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    if order.len() != modifiers.len() {
        let mut stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(&id, _)| id)
            .collect();
        stuck.sort_unstable();
        return Err(CoreError::invalid(
            "dependencies",
            format!("circular dependency among {stuck:?}"),
        ));
    }

    Ok(order)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn item(id: &str, setting: TaxSetting) -> LineItem {
        LineItem {
            id: id.into(),
            unit_price: dec!(100),
            quantity: dec!(1),
            cost: None,
            tax_setting: setting,
            use_tax_eligible: false,
            vendor_tax_collected: false,
        }
    }

    fn modifier(id: &str) -> Modifier {
        Modifier {
            id: id.into(),
            kind: ModifierKind::Percentage,
            value: dec!(-5),
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

    fn frozen(modifiers: Vec<Modifier>, deps: Vec<Dependency>) -> FrozenInput {
        FrozenInput {
            proposal_id: "p1".into(),
            tenant: None,
            schema_version: "1".into(),
            line_items: vec![
                item("a", TaxSetting::Taxable),
                item("b", TaxSetting::NonTaxable),
            ],
            modifiers,
            dependencies: deps,
            rules: vec![],
            tax_config: TaxConfig {
                mode: TaxMode::Retail,
                retail_rate: dec!(0.1),
                use_tax_rate: dec!(0),
                jurisdictions: vec![],
                schema_version: "1".into(),
            },
            context_seed: json!({}),
            fingerprint: "fp".into(),
        }
    }

    fn edge(id: &str, on: &str, kind: DependencyType) -> Dependency {
        Dependency {
            modifier_id: id.into(),
            depends_on: on.into(),
            dependency_type: kind,
        }
    }

    fn empty_ctx() -> RuleValue {
        RuleValue::from_json(&json!({}))
    }

    #[test]
    fn test_inherit_resolution() {
        let mut m = modifier("m1");
        m.line_item_id = Some("b".into());
        let input = frozen(vec![m.clone()], vec![]);
        assert_eq!(resolve_tax_setting(&m, &input), TaxSetting::NonTaxable);

        // No line reference: defaults to taxable.
        let m2 = modifier("m2");
        assert_eq!(resolve_tax_setting(&m2, &input), TaxSetting::Taxable);
    }

    #[test]
    fn test_topological_order_respects_requires() {
        let input = frozen(
            vec![modifier("late"), modifier("early")],
            vec![edge("late", "early", DependencyType::Requires)],
        );
        let (accepted, rejected) = resolve_modifiers(&input, &empty_ctx()).unwrap();
        assert!(rejected.is_empty());
        let ids: Vec<_> = accepted.iter().map(|r| r.modifier.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_missing_requirement_drops_transitively() {
        // m2 requires ghost (absent), m3 requires m2.
        let input = frozen(
            vec![modifier("m2"), modifier("m3")],
            vec![
                edge("m2", "ghost", DependencyType::Requires),
                edge("m3", "m2", DependencyType::Requires),
            ],
        );
        let (accepted, rejected) = resolve_modifiers(&input, &empty_ctx()).unwrap();
        assert!(accepted.is_empty());
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|r| r.reason == "missing_requirement"));
    }

    #[test]
    fn test_excludes_first_accepted_wins() {
        let input = frozen(
            vec![modifier("m1"), modifier("m2")],
            vec![edge("m2", "m1", DependencyType::Excludes)],
        );
        let (accepted, rejected) = resolve_modifiers(&input, &empty_ctx()).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].modifier.id, "m1");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, "m2");
        assert_eq!(rejected[0].reason, "excluded_by:m1");
    }

    #[test]
    fn test_chain_priority_breaks_ties() {
        let mut a = modifier("zz");
        a.chain_priority = 1;
        let b = modifier("aa");
        let input = frozen(vec![b, a], vec![]);
        let (accepted, _) = resolve_modifiers(&input, &empty_ctx()).unwrap();
        let ids: Vec<_> = accepted.iter().map(|r| r.modifier.id.as_str()).collect();
        assert_eq!(ids, vec!["zz", "aa"]);
    }

    #[test]
    fn test_cycle_detected() {
        let input = frozen(
            vec![modifier("m1"), modifier("m2")],
            vec![
                edge("m1", "m2", DependencyType::Requires),
                edge("m2", "m1", DependencyType::Requires),
            ],
        );
        let err = resolve_modifiers(&input, &empty_ctx()).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[test]
    fn test_rule_failure_rejects_with_reason() {
        use crate::rules::compile_rule;
        let mut input = frozen(vec![modifier("m1")], vec![]);
        input.rules = vec![compile_rule(
            "m1",
            &json!({"op": "gt", "left": {"field": "computed.subtotal"}, "right": {"value": "1000"}}),
        )
        .unwrap()];
        let ctx = RuleValue::from_json(&json!({"computed": {"subtotal": "500"}}));
        let (accepted, rejected) = resolve_modifiers(&input, &ctx).unwrap();
        assert!(accepted.is_empty());
        assert_eq!(rejected[0].reason, "rule_failed");
    }
}
