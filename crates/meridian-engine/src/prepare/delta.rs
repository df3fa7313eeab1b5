//! # Delta Optimisation
//!
//! Decides whether a request's `changes` can patch the cached frozen
//! input, or whether a full rebuild is required, and performs the
//! patch. A patch never mutates the cached value: it produces a new
//! owned `FrozenInput`.
//!
//! ## Full Rebuild Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Any one of these forces a fresh load:                                  │
//! │                                                                         │
//! │  • schema version mismatch between cache and request                    │
//! │  • cache entry older than the TTL                                       │
//! │  • more than 30% of the cached entities changed                         │
//! │  • delta complexity score above 5 (removals weigh double)               │
//! │  • dependency cascade deeper than 3 from the changed modifiers          │
//! │  • more than 3 failed delta attempts for this proposal in 5 minutes    │
//! │  • dependencies or rules themselves changed                             │
//! │  • the change type is STRUCTURAL                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use meridian_core::types::{FrozenInput, LineItem, Modifier};

use crate::error::EngineResult;
use crate::request::{ChangeType, Delta};

use super::normalize::{normalize_line_items, normalize_modifiers};

// =============================================================================
// Configuration
// =============================================================================

/// Thresholds for the rebuild decision.
#[derive(Debug, Clone)]
pub struct DeltaConfig {
    pub cache_ttl: Duration,
    /// Percent of cached entities that may change before a rebuild.
    pub max_changed_percent: u64,
    pub max_complexity: u64,
    pub max_cascade_depth: usize,
    pub max_recent_failures: usize,
    pub failure_window: Duration,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        DeltaConfig {
            cache_ttl: Duration::from_secs(3600),
            max_changed_percent: 30,
            max_complexity: 5,
            max_cascade_depth: 3,
            max_recent_failures: 3,
            failure_window: Duration::from_secs(300),
        }
    }
}

/// The optimiser's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaDecision {
    /// Patch the cached input.
    Patch,
    /// Rebuild from scratch, and why.
    Rebuild(&'static str),
}

// =============================================================================
// Optimiser
// =============================================================================

/// Stateful delta decision-maker. The failure log is per proposal and
/// self-expires past the window.
pub struct DeltaOptimizer {
    config: DeltaConfig,
    failures: Mutex<HashMap<String, Vec<Instant>>>,
}

impl DeltaOptimizer {
    pub fn new(config: DeltaConfig) -> Self {
        DeltaOptimizer {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Decides patch vs rebuild for one request.
    pub fn decide(
        &self,
        proposal_id: &str,
        cached: &FrozenInput,
        cache_age: Duration,
        request_schema_version: &str,
        delta: &Delta,
    ) -> DeltaDecision {
        if delta.change_type == ChangeType::Structural {
            return DeltaDecision::Rebuild("structural_change");
        }
        if delta.dependencies_changed || delta.rules_changed {
            return DeltaDecision::Rebuild("dependencies_or_rules_changed");
        }
        if cached.schema_version != request_schema_version {
            return DeltaDecision::Rebuild("schema_version_mismatch");
        }
        if cache_age > self.config.cache_ttl {
            return DeltaDecision::Rebuild("cache_expired");
        }

        let cached_total = (cached.line_items.len() + cached.modifiers.len()).max(1) as u64;
        let changed = delta.changed_count() as u64;
        if changed * 100 > cached_total * self.config.max_changed_percent {
            return DeltaDecision::Rebuild("too_many_changes");
        }

        let complexity = changed
            + delta.removed_modifier_ids.len() as u64
            + delta.removed_line_item_ids.len() as u64;
        if complexity > self.config.max_complexity {
            return DeltaDecision::Rebuild("complexity_score");
        }

        if cascade_depth(cached, &delta.touched_modifier_ids()) > self.config.max_cascade_depth {
            return DeltaDecision::Rebuild("cascade_depth");
        }

        if self.recent_failures(proposal_id) > self.config.max_recent_failures {
            return DeltaDecision::Rebuild("recent_delta_failures");
        }

        DeltaDecision::Patch
    }

    /// Records a failed delta attempt for the proposal.
    pub fn record_failure(&self, proposal_id: &str) {
        let mut failures = self.failures.lock().expect("failure log lock poisoned");
        failures
            .entry(proposal_id.to_string())
            .or_default()
            .push(Instant::now());
    }

    fn recent_failures(&self, proposal_id: &str) -> usize {
        let window = self.config.failure_window;
        let now = Instant::now();
        let mut failures = self.failures.lock().expect("failure log lock poisoned");
        match failures.get_mut(proposal_id) {
            None => 0,
            Some(attempts) => {
                attempts.retain(|at| now.duration_since(*at) <= window);
                attempts.len()
            }
        }
    }
}

/// How deep a change propagates through REQUIRES chains: modifiers that
/// (transitively) depend on a touched modifier are affected too.
fn cascade_depth(cached: &FrozenInput, touched: &[&str]) -> usize {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in &cached.dependencies {
        dependents
            .entry(dep.depends_on.as_str())
            .or_default()
            .push(dep.modifier_id.as_str());
    }

    let mut depth = 0;
    let mut seen: HashSet<&str> = touched.iter().copied().collect();
    let mut frontier: VecDeque<(&str, usize)> = touched.iter().map(|id| (*id, 0)).collect();

    while let Some((node, at)) = frontier.pop_front() {
        depth = depth.max(at);
        if let Some(next) = dependents.get(node) {
            for dependent in next {
                if seen.insert(dependent) {
                    frontier.push_back((dependent, at + 1));
                }
            }
        }
    }
    depth
}

// =============================================================================
// Patching
// =============================================================================

/// Builds a new frozen input from the cached one plus the delta.
/// Upserts replace by id, removals drop by id, and the arrays are
/// re-sorted into canonical order. The cached input is untouched.
pub fn apply_delta(cached: &FrozenInput, delta: &Delta) -> EngineResult<FrozenInput> {
    let mut line_items = cached.line_items.clone();
    let mut modifiers = cached.modifiers.clone();

    if delta.change_type == ChangeType::LineItem || !delta.line_items.is_empty() {
        let patches = normalize_line_items(&delta.line_items)?;
        merge_by_id(
            &mut line_items,
            patches,
            &delta.removed_line_item_ids,
            |item: &LineItem| item.id.clone(),
        );
        line_items.sort_by(|a, b| a.id.cmp(&b.id));
    }

    if delta.change_type == ChangeType::ModifierOnly || !delta.modifiers.is_empty() {
        let patches = normalize_modifiers(&delta.modifiers)?;
        merge_by_id(
            &mut modifiers,
            patches,
            &delta.removed_modifier_ids,
            |modifier: &Modifier| modifier.id.clone(),
        );
        modifiers.sort_by(|a, b| {
            (a.chain_priority, a.id.as_str()).cmp(&(b.chain_priority, b.id.as_str()))
        });
    }

    Ok(FrozenInput {
        proposal_id: cached.proposal_id.clone(),
        tenant: cached.tenant.clone(),
        schema_version: cached.schema_version.clone(),
        line_items,
        modifiers,
        dependencies: cached.dependencies.clone(),
        rules: cached.rules.clone(),
        tax_config: cached.tax_config.clone(),
        context_seed: cached.context_seed.clone(),
        fingerprint: cached.fingerprint.clone(),
    })
}

fn merge_by_id<T>(
    existing: &mut Vec<T>,
    patches: Vec<T>,
    removed: &[String],
    id_of: impl Fn(&T) -> String,
) {
    existing.retain(|entry| !removed.contains(&id_of(entry)));
    for patch in patches {
        let id = id_of(&patch);
        match existing.iter_mut().find(|entry| id_of(entry) == id) {
            Some(slot) => *slot = patch,
            None => existing.push(patch),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::types::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn cached_input() -> FrozenInput {
        FrozenInput {
            proposal_id: "p1".into(),
            tenant: None,
            schema_version: "1".into(),
            line_items: vec![LineItem {
                id: "a".into(),
                unit_price: dec!(100),
                quantity: dec!(1),
                cost: None,
                tax_setting: TaxSetting::Taxable,
                use_tax_eligible: false,
                vendor_tax_collected: false,
            }],
            modifiers: (0..10)
                .map(|i| Modifier {
                    id: format!("m{i}"),
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
                })
                .collect(),
            dependencies: vec![],
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

    fn delta(change_type: ChangeType) -> Delta {
        Delta {
            change_type,
            modifiers: vec![],
            line_items: vec![],
            removed_modifier_ids: vec![],
            removed_line_item_ids: vec![],
            dependencies_changed: false,
            rules_changed: false,
        }
    }

    fn modifier_patch(id: &str, value: &str) -> crate::request::RawModifier {
        serde_json::from_value(json!({
            "id": id, "kind": "percentage", "value": value, "category": "discount"
        }))
        .unwrap()
    }

    #[test]
    fn test_small_modifier_delta_patches() {
        let optimizer = DeltaOptimizer::new(DeltaConfig::default());
        let mut d = delta(ChangeType::ModifierOnly);
        d.modifiers = vec![modifier_patch("m1", "-2")];

        let decision = optimizer.decide("p1", &cached_input(), Duration::from_secs(10), "1", &d);
        assert_eq!(decision, DeltaDecision::Patch);
    }

    #[test]
    fn test_structural_and_rule_changes_force_rebuild() {
        let optimizer = DeltaOptimizer::new(DeltaConfig::default());
        let cached = cached_input();

        let d = delta(ChangeType::Structural);
        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::ZERO, "1", &d),
            DeltaDecision::Rebuild("structural_change")
        ));

        let mut d = delta(ChangeType::ModifierOnly);
        d.rules_changed = true;
        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::ZERO, "1", &d),
            DeltaDecision::Rebuild("dependencies_or_rules_changed")
        ));
    }

    #[test]
    fn test_schema_mismatch_and_expiry_force_rebuild() {
        let optimizer = DeltaOptimizer::new(DeltaConfig::default());
        let cached = cached_input();
        let d = delta(ChangeType::ModifierOnly);

        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::ZERO, "2", &d),
            DeltaDecision::Rebuild("schema_version_mismatch")
        ));
        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::from_secs(4000), "1", &d),
            DeltaDecision::Rebuild("cache_expired")
        ));
    }

    #[test]
    fn test_thirty_percent_threshold() {
        let optimizer = DeltaOptimizer::new(DeltaConfig::default());
        let cached = cached_input(); // 11 entities

        let mut d = delta(ChangeType::ModifierOnly);
        d.modifiers = (0..4).map(|i| modifier_patch(&format!("m{i}"), "-2")).collect();
        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::ZERO, "1", &d),
            DeltaDecision::Rebuild("too_many_changes")
        ));
    }

    #[test]
    fn test_failure_budget_forces_rebuild() {
        let optimizer = DeltaOptimizer::new(DeltaConfig::default());
        let cached = cached_input();
        for _ in 0..4 {
            optimizer.record_failure("p1");
        }

        let mut d = delta(ChangeType::ModifierOnly);
        d.modifiers = vec![modifier_patch("m1", "-2")];
        assert!(matches!(
            optimizer.decide("p1", &cached, Duration::ZERO, "1", &d),
            DeltaDecision::Rebuild("recent_delta_failures")
        ));
        // A different proposal is unaffected.
        assert_eq!(
            optimizer.decide("p2", &cached, Duration::ZERO, "1", &d),
            DeltaDecision::Patch
        );
    }

    #[test]
    fn test_cascade_depth() {
        let mut cached = cached_input();
        // m3 requires m2 requires m1 requires m0: touching m0 cascades 3.
        cached.dependencies = (0..3)
            .map(|i| Dependency {
                modifier_id: format!("m{}", i + 1),
                depends_on: format!("m{i}"),
                dependency_type: DependencyType::Requires,
            })
            .collect();
        assert_eq!(cascade_depth(&cached, &["m0"]), 3);
        assert_eq!(cascade_depth(&cached, &["m2"]), 1);
        assert_eq!(cascade_depth(&cached, &["m9"]), 0);
    }

    #[test]
    fn test_apply_delta_produces_new_input() {
        let cached = cached_input();
        let mut d = delta(ChangeType::ModifierOnly);
        d.modifiers = vec![modifier_patch("m1", "-7.5"), modifier_patch("m99", "-1")];
        d.removed_modifier_ids = vec!["m2".into()];

        let patched = apply_delta(&cached, &d).unwrap();

        // Upsert replaced m1, removal dropped m2, m99 appended.
        assert_eq!(
            patched.modifiers.iter().find(|m| m.id == "m1").unwrap().value,
            dec!(-7.5)
        );
        assert!(!patched.modifiers.iter().any(|m| m.id == "m2"));
        assert!(patched.modifiers.iter().any(|m| m.id == "m99"));

        // The cached input is untouched.
        assert_eq!(cached.modifiers.len(), 10);
        assert_eq!(cached.modifiers.iter().find(|m| m.id == "m1").unwrap().value, dec!(-1));
    }
}
