//! # Validation Floor
//!
//! Every computation passes this floor before any pricing work happens.
//! Two failure classes come out of here, and callers treat them
//! differently:
//!
//! - `INVALID_INPUT` - the request is malformed (duplicates, bad
//!   numerics, dangling references). Fixable by the caller.
//! - `RESOURCE_LIMIT` - the request is well-formed but too big. Soft
//!   ceilings are the advertised limits; hard ceilings abort regardless
//!   of configuration.
//!
//! The 5-second wall budget is enforced here as a *deterministic cost
//! estimate*: the pure stage holds no clock, so the same input must be
//! accepted or rejected identically on every run. The orchestrator
//! additionally wraps the stage in a real wall-clock timeout.

use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, CoreResult, Violation};
use crate::rules::MAX_EVAL_OPS;
use crate::types::{Dependency, DependencyType, FrozenInput};
use crate::{
    HARD_MAX_MODIFIERS, MAX_DEPENDENCY_DEPTH, MAX_LINE_ITEMS, MAX_MODIFIERS,
};

// =============================================================================
// Limits
// =============================================================================

/// Resource ceilings for one computation.
#[derive(Debug, Clone)]
pub struct ComputeLimits {
    pub max_line_items: usize,
    pub max_modifiers: usize,
    pub max_groups: usize,
    pub max_dependency_depth: usize,
    /// Deterministic stand-in for the 5 s wall budget.
    pub max_cost_units: u64,
}

impl Default for ComputeLimits {
    fn default() -> Self {
        ComputeLimits {
            max_line_items: MAX_LINE_ITEMS,
            max_modifiers: MAX_MODIFIERS,
            max_groups: crate::MAX_GROUPS,
            max_dependency_depth: MAX_DEPENDENCY_DEPTH,
            // Calibrated so the worst accepted case (5000 items × 1000
            // modifiers) stays well inside the wall budget.
            max_cost_units: 25_000_000,
        }
    }
}

fn limit_err(resource: &str, actual: usize, limit: usize) -> CoreError {
    CoreError::ResourceLimit {
        resource: resource.to_string(),
        actual: actual as u64,
        limit: limit as u64,
    }
}

// =============================================================================
// Floor
// =============================================================================

/// Validates a frozen input against the floor. Returns all input
/// violations at once; resource violations fail fast.
pub fn validate_floor(input: &FrozenInput, limits: &ComputeLimits) -> CoreResult<()> {
    // Hard ceilings first: configuration cannot raise these.
    if input.modifiers.len() > HARD_MAX_MODIFIERS {
        return Err(limit_err("modifiers", input.modifiers.len(), HARD_MAX_MODIFIERS));
    }
    if input.modifiers.len() > limits.max_modifiers {
        return Err(limit_err("modifiers", input.modifiers.len(), limits.max_modifiers));
    }
    if input.line_items.len() > limits.max_line_items {
        return Err(limit_err("line_items", input.line_items.len(), limits.max_line_items));
    }

    let cost = estimate_cost_units(input);
    if cost > limits.max_cost_units {
        return Err(CoreError::ResourceLimit {
            resource: "estimated_cost_units".to_string(),
            actual: cost,
            limit: limits.max_cost_units,
        });
    }

    let depth = dependency_depth(&input.dependencies)?;
    if depth > limits.max_dependency_depth {
        return Err(limit_err("dependency_depth", depth, limits.max_dependency_depth));
    }

    let mut violations = Vec::new();

    if input.schema_version.trim().is_empty() {
        violations.push(Violation::new("config.schemaVersion", "missing schema version"));
    }
    if input.tax_config.schema_version.trim().is_empty() {
        violations.push(Violation::new("config.schemaVersion", "missing schema version"));
    }

    let mut seen_modifiers = HashSet::new();
    for (i, modifier) in input.modifiers.iter().enumerate() {
        if !seen_modifiers.insert(modifier.id.as_str()) {
            violations.push(Violation::new(
                format!("modifiers[{i}].id"),
                format!("duplicate modifier id '{}'", modifier.id),
            ));
        }
    }

    let mut seen_items = HashSet::new();
    for (i, item) in input.line_items.iter().enumerate() {
        if !seen_items.insert(item.id.as_str()) {
            violations.push(Violation::new(
                format!("lineItems[{i}].id"),
                format!("duplicate line item id '{}'", item.id),
            ));
        }
        if item.quantity.is_sign_negative() {
            violations.push(Violation::new(
                format!("lineItems[{i}].quantity"),
                "quantity must not be negative",
            ));
        }
    }

    // Referential integrity: dependencies must point at known modifiers
    // on both ends.
    for (i, dep) in input.dependencies.iter().enumerate() {
        if !seen_modifiers.contains(dep.modifier_id.as_str()) {
            violations.push(Violation::new(
                format!("dependencies[{i}].modifierId"),
                format!("unknown modifier '{}'", dep.modifier_id),
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(violations))
    }
}

// =============================================================================
// Cost Estimate
// =============================================================================

/// Deterministic upper bound on the work one computation can do.
pub fn estimate_cost_units(input: &FrozenInput) -> u64 {
    let items = input.line_items.len() as u64;
    let modifiers = input.modifiers.len() as u64;
    let rules = input.rules.len() as u64;
    items * (modifiers + 1) + rules * MAX_EVAL_OPS as u64
}

// =============================================================================
// Dependency Depth
// =============================================================================

/// Longest chain in the dependency graph. A cycle is reported as
/// `INVALID_INPUT` (cycles can never satisfy a depth bound).
pub fn dependency_depth(dependencies: &[Dependency]) -> CoreResult<usize> {
    // EXCLUDES edges are mutual vetoes, not ordering constraints; only
    // REQUIRES edges form chains.
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in dependencies {
        if dep.dependency_type == DependencyType::Requires {
            edges.entry(dep.modifier_id.as_str())
                .or_default()
                .push(dep.depends_on.as_str());
        }
    }

    let mut roots: Vec<&str> = edges.keys().copied().collect();
    roots.sort_unstable();

    let mut memo: HashMap<&str, usize> = HashMap::new();
    let mut max_depth = 0;
    for node in roots {
        let mut visiting = HashSet::new();
        max_depth = max_depth.max(chain_depth(node, &edges, &mut memo, &mut visiting)?);
    }
    Ok(max_depth)
}

fn chain_depth<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    memo: &mut HashMap<&'a str, usize>,
    visiting: &mut HashSet<&'a str>,
) -> CoreResult<usize> {
    if let Some(&depth) = memo.get(node) {
        return Ok(depth);
    }
    if !visiting.insert(node) {
        return Err(CoreError::invalid(
            "dependencies",
            format!("circular dependency involving '{node}'"),
        ));
    }

    let mut depth = 0;
    if let Some(targets) = edges.get(node) {
        for target in targets {
            depth = depth.max(1 + chain_depth(target, edges, memo, visiting)?);
        }
    }

    visiting.remove(node);
    memo.insert(node, depth);
    Ok(depth)
}

// =============================================================================
// Unit Tests
// =============================================================================
