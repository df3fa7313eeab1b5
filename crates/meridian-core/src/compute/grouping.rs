//! # Modifier Grouping
//!
//! Collapses accepted modifiers into groups by the eight grouping
//! attributes and fixes the deterministic application order.
//!
//! ## Ordering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Groups are applied in this order, every time:                          │
//! │                                                                         │
//! │  (a) application-type cohort   pre_tax < post_tax                       │
//! │  (b) category                  discount < rebate < fee < bonus          │
//! │                                < adjustment                             │
//! │  (c) kind                      percentage < fixed < margin              │
//! │  (d) minimum chain priority    lower first                              │
//! │  (e) earliest created_at       missing timestamps first                 │
//! │  (f) group key                 lexicographic, final tie-break           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Within a group, values sum additively: two 5% discounts with equal
//! keys become one 10% group.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{CoreError, CoreResult};
use crate::types::GroupKey;
use crate::HARD_MAX_GROUPS;

use super::graph::ResolvedModifier;

/// A maximal set of modifiers sharing the eight grouping attributes.
#[derive(Debug, Clone)]
pub struct ModifierGroup {
    pub key: GroupKey,
    /// Members in acceptance (topological) order.
    pub members: Vec<ResolvedModifier>,
    /// Sum of member values.
    pub combined_value: Decimal,
    min_chain_priority: i32,
    min_created_at: Option<DateTime<Utc>>,
}

impl ModifierGroup {
    pub fn modifier_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.modifier.id.clone()).collect()
    }
}

/// Groups accepted modifiers and sorts the groups into application
/// order. Enforces the group ceilings.
pub fn group_modifiers(
    accepted: Vec<ResolvedModifier>,
    max_groups: usize,
) -> CoreResult<Vec<ModifierGroup>> {
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<ModifierGroup> = Vec::new();

    for resolved in accepted {
        let key = GroupKey {
            tax_setting: resolved.tax_setting,
            kind: resolved.modifier.kind,
            category: resolved.modifier.category,
            affects_quantity: resolved.modifier.affects_quantity,
            cost_percentage: resolved.modifier.cost_percentage,
            display_mode: resolved.modifier.display_mode.clone(),
            application_type: resolved.modifier.application_type,
            product_id: resolved.modifier.product_id.clone(),
        };

        match index.get(&key) {
            Some(&at) => {
                let group = &mut groups[at];
                group.combined_value += resolved.modifier.value;
                group.min_chain_priority =
                    group.min_chain_priority.min(resolved.modifier.chain_priority);
                group.min_created_at = match (group.min_created_at, resolved.modifier.created_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                group.members.push(resolved);
            }
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(ModifierGroup {
                    combined_value: resolved.modifier.value,
                    min_chain_priority: resolved.modifier.chain_priority,
                    min_created_at: resolved.modifier.created_at,
                    key,
                    members: vec![resolved],
                });
            }
        }
    }

    if groups.len() > HARD_MAX_GROUPS {
        return Err(group_limit_err(groups.len(), HARD_MAX_GROUPS));
    }
    if groups.len() > max_groups {
        return Err(group_limit_err(groups.len(), max_groups));
    }

    groups.sort_by(|a, b| ordering_key(a).cmp(&ordering_key(b)));
    Ok(groups)
}

fn group_limit_err(actual: usize, limit: usize) -> CoreError {
    CoreError::ResourceLimit {
        resource: "groups".to_string(),
        actual: actual as u64,
        limit: limit as u64,
    }
}

type OrderingKey = (u8, u8, u8, i32, Option<DateTime<Utc>>, String);

fn ordering_key(group: &ModifierGroup) -> OrderingKey {
    (
        group.key.application_type.rank(),
        group.key.category.rank(),
        group.key.kind.rank(),
        group.min_chain_priority,
        // None < Some for Option's Ord: absent timestamps sort first,
        // which is what "earliest ascending" degrades to.
        group.min_created_at,
        group.key.canonical_string(),
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
