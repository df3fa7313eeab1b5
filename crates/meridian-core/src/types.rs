//! # Domain Types
//!
//! Core domain types used throughout Meridian.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    LineItem     │   │    Modifier     │   │   Dependency    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  id             │   │  modifier_id    │       │
//! │  │  unit_price     │   │  kind           │   │  depends_on     │       │
//! │  │  quantity       │   │  value          │   │  REQUIRES /     │       │
//! │  │  tax_setting    │   │  chain_priority │   │  EXCLUDES       │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  TaxConfig ──► FrozenInput ──► compute() ──► CalculationResult         │
//! │                (immutable)                    (Q2/Q7 strings +         │
//! │                                                checksum)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All monetary fields on input types are `Decimal` (parsed once, at the
//! normalisation boundary). All monetary fields on output types are
//! pre-rendered Q2/Q7 **strings**, so serialisation can never perturb a
//! checksummed value.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::CompiledRule;

// =============================================================================
// Tax Settings
// =============================================================================

/// Tax classification of a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxSetting {
    Taxable,
    NonTaxable,
}

impl TaxSetting {
    /// Stable token used in group keys and audit attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxSetting::Taxable => "taxable",
            TaxSetting::NonTaxable => "non_taxable",
        }
    }
}

/// Tax classification of a modifier. `Inherit` resolves from the
/// referenced line item, defaulting to taxable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModifierTaxSetting {
    Taxable,
    NonTaxable,
    #[default]
    Inherit,
}

// =============================================================================
// Modifier Enums
// =============================================================================

/// What a modifier does to the running subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierKind {
    /// Percentage of the running subtotal (negative = discount).
    Percentage,
    /// Fixed amount, allocated across line items.
    Fixed,
    /// Reprices lines to hit a target margin.
    Margin,
}

impl ModifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierKind::Percentage => "percentage",
            ModifierKind::Fixed => "fixed",
            ModifierKind::Margin => "margin",
        }
    }

    /// Rank inside a cohort. The full ordering reserves slots for
    /// quantity and cost-adjustment kinds that the input model does not
    /// construct.
    pub fn rank(&self) -> u8 {
        match self {
            ModifierKind::Percentage => 0,
            ModifierKind::Fixed => 1,
            ModifierKind::Margin => 2,
        }
    }
}

/// Business category of a modifier. Closed set; the category order is
/// part of the deterministic group ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierCategory {
    Discount,
    Rebate,
    Fee,
    Bonus,
    Adjustment,
}

impl ModifierCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierCategory::Discount => "discount",
            ModifierCategory::Rebate => "rebate",
            ModifierCategory::Fee => "fee",
            ModifierCategory::Bonus => "bonus",
            ModifierCategory::Adjustment => "adjustment",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            ModifierCategory::Discount => 0,
            ModifierCategory::Rebate => 1,
            ModifierCategory::Fee => 2,
            ModifierCategory::Bonus => 3,
            ModifierCategory::Adjustment => 4,
        }
    }
}

/// Whether a modifier applies before or after retail tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    PreTax,
    PostTax,
}

impl ApplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::PreTax => "pre_tax",
            ApplicationType::PostTax => "post_tax",
        }
    }

    /// Cohort rank. The middle slot belongs to the cost cohort, which the
    /// input model does not construct.
    pub fn rank(&self) -> u8 {
        match self {
            ApplicationType::PreTax => 0,
            ApplicationType::PostTax => 2,
        }
    }
}

/// What a margin modifier does when a line item has no cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingCostStrategy {
    /// Leave the line untouched.
    #[default]
    Skip,
    /// Derive cost from `cost_percentage` of the current price.
    UseDefault,
    /// Fail the whole computation.
    Fail,
}

// =============================================================================
// Input Entities
// =============================================================================

/// One line of a proposal. Canonical form: produced by the normaliser,
/// sorted by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: String,
    pub unit_price: Decimal,
    /// Never negative. Decimal because quantities can be fractional
    /// (hours, partial units).
    pub quantity: Decimal,
    /// Absent when the vendor does not track cost for this line.
    pub cost: Option<Decimal>,
    pub tax_setting: TaxSetting,
    pub use_tax_eligible: bool,
    pub vendor_tax_collected: bool,
}

/// A pricing modifier. Canonical form: sorted by
/// `(chain_priority, id)`, defaults filled by the normaliser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifier {
    pub id: String,
    pub kind: ModifierKind,
    /// Percentage points, fixed amount, or target margin percentage,
    /// depending on `kind`.
    pub value: Decimal,
    pub tax_setting: ModifierTaxSetting,
    pub category: ModifierCategory,
    pub affects_quantity: bool,
    pub cost_percentage: Option<Decimal>,
    pub display_mode: String,
    pub application_type: ApplicationType,
    pub product_id: Option<String>,
    /// Lower applies earlier. Default 999.
    pub chain_priority: i32,
    /// Line item this modifier is pinned to, if any. Also the source of
    /// an inherited tax setting.
    pub line_item_id: Option<String>,
    /// Group-ordering tie-break only.
    pub created_at: Option<DateTime<Utc>>,
    pub missing_cost_strategy: MissingCostStrategy,
}

/// Direction of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// The modifier applies only if its target applies.
    Requires,
    /// The modifier and its target cannot both apply.
    Excludes,
}

/// A directed edge in the modifier dependency DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub modifier_id: String,
    pub depends_on: String,
    #[serde(rename = "type")]
    pub dependency_type: DependencyType,
}

// =============================================================================
// Tax Configuration
// =============================================================================

/// Tax computation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxMode {
    /// Customer-facing retail tax only.
    Retail,
    /// Internal use-tax liability only.
    UseTax,
    /// Both.
    Mixed,
}

impl TaxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxMode::Retail => "RETAIL",
            TaxMode::UseTax => "USE_TAX",
            TaxMode::Mixed => "MIXED",
        }
    }

    /// Whether retail tax is computed in this mode.
    pub fn retail(&self) -> bool {
        matches!(self, TaxMode::Retail | TaxMode::Mixed)
    }

    /// Whether use tax is computed in this mode.
    pub fn use_tax(&self) -> bool {
        matches!(self, TaxMode::UseTax | TaxMode::Mixed)
    }
}

/// One tax jurisdiction. Applied in `(order, code)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Jurisdiction {
    pub code: String,
    pub order: i32,
    pub rate: Decimal,
}

/// Tax configuration for one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxConfig {
    pub mode: TaxMode,
    pub retail_rate: Decimal,
    pub use_tax_rate: Decimal,
    pub jurisdictions: Vec<Jurisdiction>,
    pub schema_version: String,
}

// =============================================================================
// Frozen Input
// =============================================================================

/// The normalised, immutable input to the pure compute stage.
///
/// ## Immutability
/// Preparation builds exactly one of these and hands out
/// `Arc<FrozenInput>`. Nothing downstream holds a `&mut`; delta patches
/// produce a *new* value rather than mutating. That single-owner,
/// read-only-view discipline is what "frozen" means here.
#[derive(Debug, Clone)]
pub struct FrozenInput {
    pub proposal_id: String,
    pub tenant: Option<String>,
    pub schema_version: String,
    /// Sorted by id.
    pub line_items: Vec<LineItem>,
    /// Sorted by (chain_priority, id).
    pub modifiers: Vec<Modifier>,
    /// Sorted by (depends_on, modifier_id).
    pub dependencies: Vec<Dependency>,
    /// Compiled and validated rules, keyed by modifier in each entry.
    pub rules: Vec<CompiledRule>,
    pub tax_config: TaxConfig,
    /// Pass-through context (proposal metadata, customer, project) for
    /// rule evaluation. Opaque to the pipeline itself.
    pub context_seed: Value,
    /// Canonical fingerprint of the request this input was built from
    /// (the `changes` delta excluded). Cache key, not checksum.
    pub fingerprint: String,
}

// =============================================================================
// Group Key
// =============================================================================

/// The eight grouping attributes. Modifiers with equal keys collapse to
/// one group whose values sum additively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    pub tax_setting: TaxSetting,
    pub kind: ModifierKind,
    pub category: ModifierCategory,
    pub affects_quantity: bool,
    pub cost_percentage: Option<Decimal>,
    pub display_mode: String,
    pub application_type: ApplicationType,
    pub product_id: Option<String>,
}

impl GroupKey {
    /// Stable textual rendering: the final lexicographic tie-break in
    /// group ordering, and the `group_key` column in audit rows.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.tax_setting.as_str(),
            self.kind.as_str(),
            self.category.as_str(),
            self.affects_quantity,
            self.cost_percentage
                .map(|c| c.normalize().to_string())
                .unwrap_or_else(|| "null".to_string()),
            self.display_mode,
            self.application_type.as_str(),
            self.product_id.as_deref().unwrap_or("null"),
        )
    }
}

// =============================================================================
// Output Entities
// =============================================================================

/// Per-line share of a group adjustment. Allocations sum exactly to the
/// group amount at Q7.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineAllocation {
    pub line_item_id: String,
    pub amount_q7: String,
}

/// One applied modifier group, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustment {
    pub group_key: String,
    pub tax_setting: TaxSetting,
    pub kind: ModifierKind,
    pub category: ModifierCategory,
    pub application_type: ApplicationType,
    /// Sum of the group's modifier values.
    pub combined_value: String,
    pub amount: String,
    pub amount_q7: String,
    pub modifier_ids: Vec<String>,
    pub per_line_allocations: Vec<LineAllocation>,
}

/// A modifier that did not apply, and why: `missing_requirement`,
/// `excluded_by:<id>`, `rule_failed`, or `rule_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedModifier {
    pub id: String,
    pub reason: String,
}

/// One jurisdiction's share of retail tax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JurisdictionTax {
    pub code: String,
    pub rate: String,
    pub amount: String,
    pub amount_q7: String,
}

/// The canonical result of one computation.
///
/// Every monetary field is a pre-rendered decimal string (Q2 for the
/// customer-facing block, Q7 for the audit block), so re-serialising a
/// result can never change its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationResult {
    pub proposal_id: String,
    pub schema_version: String,
    pub engine_version: String,
    pub tax_mode: String,

    // Customer-facing (Q2)
    pub subtotal: String,
    pub modifier_total: String,
    pub retail_tax: String,
    pub customer_grand_total: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_tax: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_tax_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_grand_total: Option<String>,

    pub adjustments: Vec<Adjustment>,
    pub rejected: Vec<RejectedModifier>,
    pub jurisdiction_taxes: Vec<JurisdictionTax>,

    // Audit components (Q7)
    pub subtotal_q7: String,
    pub taxable_base_q7: String,
    pub non_taxable_base_q7: String,
    pub modifier_total_q7: String,
    pub retail_tax_q7: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_tax_q7: Option<String>,
    pub customer_grand_total_q7: String,

    /// SHA-256 over the canonical encoding of everything above.
    pub checksum: String,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tax_setting_serde_tokens() {
        assert_eq!(
            serde_json::to_string(&TaxSetting::NonTaxable).unwrap(),
            r#""NON_TAXABLE""#
        );
        assert_eq!(
            serde_json::to_string(&ModifierTaxSetting::Inherit).unwrap(),
            r#""inherit""#
        );
    }

    #[test]
    fn test_tax_mode_flags() {
        assert!(TaxMode::Retail.retail());
        assert!(!TaxMode::Retail.use_tax());
        assert!(TaxMode::UseTax.use_tax());
        assert!(!TaxMode::UseTax.retail());
        assert!(TaxMode::Mixed.retail() && TaxMode::Mixed.use_tax());
    }

    #[test]
    fn test_group_key_canonical_string() {
        let key = GroupKey {
            tax_setting: TaxSetting::Taxable,
            kind: ModifierKind::Percentage,
            category: ModifierCategory::Discount,
            affects_quantity: false,
            cost_percentage: None,
            display_mode: "standard".into(),
            application_type: ApplicationType::PreTax,
            product_id: None,
        };
        assert_eq!(
            key.canonical_string(),
            "taxable|percentage|discount|false|null|standard|pre_tax|null"
        );

        let with_product = GroupKey {
            product_id: Some("sku-9".into()),
            cost_percentage: Some(dec!(40.0)),
            ..key
        };
        assert_eq!(
            with_product.canonical_string(),
            "taxable|percentage|discount|false|40|standard|pre_tax|sku-9"
        );
    }

    #[test]
    fn test_category_and_kind_ranks_follow_application_order() {
        assert!(ModifierCategory::Discount.rank() < ModifierCategory::Rebate.rank());
        assert!(ModifierCategory::Bonus.rank() < ModifierCategory::Adjustment.rank());
        assert!(ModifierKind::Percentage.rank() < ModifierKind::Fixed.rank());
        assert!(ModifierKind::Fixed.rank() < ModifierKind::Margin.rank());
        assert!(ApplicationType::PreTax.rank() < ApplicationType::PostTax.rank());
    }
}
