//! # Wire Types
//!
//! The calculate request/response shapes and the request fingerprint.
//!
//! Decimal fields arrive as JSON strings (preferred) or JSON numbers.
//! Either way the *text* is parsed - `serde_json`'s
//! `arbitrary_precision` feature keeps number literals verbatim, so no
//! value ever reconstructs through an `f64`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use meridian_core::decimal::parse_decimal;
use meridian_core::error::Violation;
use meridian_core::fingerprint::fingerprint;
use meridian_core::types::CalculationResult;
use std::sync::Arc;

// =============================================================================
// Request
// =============================================================================

/// One pricing request. Carries the full inputs inline; a request with
/// empty arrays is served from the proposal store instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateRequest {
    pub proposal_id: String,

    /// Pass-through tenant identifier (audit only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    #[serde(default)]
    pub line_items: Vec<RawLineItem>,

    #[serde(default)]
    pub modifiers: Vec<RawModifier>,

    #[serde(default)]
    pub dependencies: Vec<RawDependency>,

    #[serde(default)]
    pub rules: Vec<RawRule>,

    pub config: RawTaxConfig,

    /// Pass-through rule-evaluation context (customer, project,
    /// proposal metadata). Opaque to the pipeline.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    /// Incremental changes against the cached prepared input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Delta>,
}

impl CalculateRequest {
    /// Whether the request carries its inputs inline.
    pub fn has_inline_payload(&self) -> bool {
        !self.line_items.is_empty() || !self.modifiers.is_empty()
    }
}

/// Raw line item as received. Decimal fields stay JSON values until the
/// normaliser parses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLineItem {
    pub id: String,
    pub unit_price: Value,
    pub quantity: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_setting: Option<String>,
    #[serde(default)]
    pub use_tax_eligible: bool,
    #[serde(default)]
    pub vendor_tax_collected: bool,
}

/// Raw modifier as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawModifier {
    pub id: String,
    pub kind: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_setting: Option<String>,
    pub category: String,
    #[serde(default)]
    pub affects_quantity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_percentage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_cost_strategy: Option<String>,
}

/// Raw dependency edge as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDependency {
    pub modifier_id: String,
    pub depends_on: String,
    #[serde(rename = "type")]
    pub dependency_type: String,
}

/// Raw rule as received: a modifier id plus its expression tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    pub modifier_id: String,
    pub expression: Value,
}

/// Raw tax configuration as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaxConfig {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retail_rate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tax_rate: Option<Value>,
    #[serde(default)]
    pub jurisdictions: Vec<RawJurisdiction>,
    pub schema_version: String,
}

/// Raw jurisdiction as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawJurisdiction {
    pub code: String,
    pub order: i32,
    pub rate: Value,
}

// =============================================================================
// Delta
// =============================================================================

/// Kind of incremental change a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Only modifiers changed.
    ModifierOnly,
    /// Only line items changed.
    LineItem,
    /// Anything else; always forces a full rebuild.
    Structural,
}

/// Incremental changes against the cached prepared input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub change_type: ChangeType,
    #[serde(default)]
    pub modifiers: Vec<RawModifier>,
    #[serde(default)]
    pub line_items: Vec<RawLineItem>,
    #[serde(default)]
    pub removed_modifier_ids: Vec<String>,
    #[serde(default)]
    pub removed_line_item_ids: Vec<String>,
    #[serde(default)]
    pub dependencies_changed: bool,
    #[serde(default)]
    pub rules_changed: bool,
}

impl Delta {
    /// Total number of changed entities, for the 30% rebuild threshold.
    pub fn changed_count(&self) -> usize {
        self.modifiers.len()
            + self.line_items.len()
            + self.removed_modifier_ids.len()
            + self.removed_line_item_ids.len()
    }

    /// Ids of modifiers this delta touches (for cascade analysis).
    pub fn touched_modifier_ids(&self) -> Vec<&str> {
        self.modifiers
            .iter()
            .map(|m| m.id.as_str())
            .chain(self.removed_modifier_ids.iter().map(String::as_str))
            .collect()
    }
}

// =============================================================================
// Response
// =============================================================================

/// Per-stage latencies reported back with every result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub preparation_ms: u64,
    pub compute_ms: u64,
    pub commit_ms: u64,
    pub total_ms: u64,
}

/// The response: the canonical result plus diagnostics. Diagnostics are
/// outside the result and never enter its checksum.
#[derive(Debug, Clone)]
pub struct CalculateResponse {
    pub result: Arc<CalculationResult>,
    /// True when the commit stage replayed a stored result
    /// (IDEMPOTENCY_REPLAY; informational, not a failure).
    pub replay: bool,
    pub timings: StageTimings,
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Canonical fingerprint of a request with the `changes` delta removed.
/// This is the prepare-cache key: a request and its delta-carrying
/// retry address the same cached input.
pub fn request_fingerprint(request: &CalculateRequest) -> String {
    let mut value = serde_json::to_value(request).expect("request serialization is infallible");
    if let Some(map) = value.as_object_mut() {
        map.remove("changes");
    }
    fingerprint(&value)
}

// =============================================================================
// Decimal Field Parsing
// =============================================================================

/// Parses a decimal field that may be a JSON string or number. Pushes a
/// violation and returns `None` on failure.
pub fn decimal_field(value: &Value, field: &str, violations: &mut Vec<Violation>) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            violations.push(Violation::new(
                field,
                format!("expected a decimal string, got {other}"),
            ));
            return None;
        }
    };

    match parse_decimal(&text) {
        Ok(decimal) => Some(decimal),
        Err(_) => {
            violations.push(Violation::new(
                field,
                format!("'{text}' is not a valid decimal"),
            ));
            None
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(changes: Option<Delta>) -> CalculateRequest {
        serde_json::from_value(json!({
            "proposalId": "p1",
            "lineItems": [
                {"id": "a", "unitPrice": "100.00", "quantity": 2, "taxSetting": "TAXABLE"}
            ],
            "config": {"mode": "RETAIL", "retailRate": "0.10", "schemaVersion": "1"}
        }))
        .map(|mut r: CalculateRequest| {
            r.changes = changes;
            r
        })
        .unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_changes() {
        let without = request(None);
        let with = request(Some(Delta {
            change_type: ChangeType::ModifierOnly,
            modifiers: vec![],
            line_items: vec![],
            removed_modifier_ids: vec!["m1".into()],
            removed_line_item_ids: vec![],
            dependencies_changed: false,
            rules_changed: false,
        }));
        assert_eq!(request_fingerprint(&without), request_fingerprint(&with));
    }

    #[test]
    fn test_fingerprint_sees_payload_changes() {
        let a = request(None);
        let mut b = request(None);
        b.proposal_id = "p2".into();
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_decimal_field_accepts_strings_and_numbers() {
        let mut violations = Vec::new();
        assert_eq!(
            decimal_field(&json!("1.5e2"), "f", &mut violations),
            Some(Decimal::from(150))
        );
        assert_eq!(
            decimal_field(&json!(2), "f", &mut violations),
            Some(Decimal::from(2))
        );
        assert!(violations.is_empty());

        assert_eq!(decimal_field(&json!(true), "f", &mut violations), None);
        assert_eq!(decimal_field(&json!("abc"), "f", &mut violations), None);
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_delta_changed_count() {
        let delta = Delta {
            change_type: ChangeType::ModifierOnly,
            modifiers: vec![],
            line_items: vec![],
            removed_modifier_ids: vec!["a".into(), "b".into()],
            removed_line_item_ids: vec![],
            dependencies_changed: false,
            rules_changed: false,
        };
        assert_eq!(delta.changed_count(), 2);
    }
}
