//! # Normalisation
//!
//! Turns a raw request into canonical, typed input:
//!
//! - canonical field names and enums, defaults filled
//!   (`chain_priority → 999`, `application_type → pre_tax`,
//!   `tax_setting → inherit`)
//! - decimal strings parsed once (exponential forms expanded, negative
//!   zero removed); numbers never pass through floats
//! - line items sorted by `id`, modifiers by `(chain_priority, id)`,
//!   dependencies by `(depends_on, modifier_id)`
//! - duplicate ids, dangling references, unknown enum tokens, and
//!   circular dependencies reported together as one `INVALID_INPUT`
//!   with the full violation list

use serde_json::Value;

use meridian_core::error::{CoreError, Violation};
use meridian_core::types::{
    ApplicationType, Dependency, DependencyType, Jurisdiction, LineItem, MissingCostStrategy,
    Modifier, ModifierCategory, ModifierKind, ModifierTaxSetting, TaxConfig, TaxMode, TaxSetting,
};
use meridian_core::validate::dependency_depth;
use meridian_core::DEFAULT_CHAIN_PRIORITY;

use meridian_db::ProposalSnapshot;

use crate::error::EngineResult;
use crate::request::{
    decimal_field, CalculateRequest, RawDependency, RawJurisdiction, RawLineItem, RawModifier,
    RawRule, RawTaxConfig,
};

/// Canonical input, minus rule compilation (the prepare stage compiles
/// rules through its cache).
#[derive(Debug, Clone)]
pub struct NormalizedInput {
    pub line_items: Vec<LineItem>,
    pub modifiers: Vec<Modifier>,
    pub dependencies: Vec<Dependency>,
    pub tax_config: TaxConfig,
    /// `(modifier_id, expression)` pairs, sorted by modifier id.
    pub rule_sources: Vec<(String, Value)>,
}

/// Normalises a raw request. All violations are collected before
/// failing so a caller sees every problem at once.
pub fn normalize(request: &CalculateRequest) -> EngineResult<NormalizedInput> {
    let mut violations: Vec<Violation> = Vec::new();

    let mut line_items: Vec<LineItem> = request
        .line_items
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| normalize_line_item(raw, i, &mut violations))
        .collect();
    line_items.sort_by(|a, b| a.id.cmp(&b.id));

    let mut modifiers: Vec<Modifier> = request
        .modifiers
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| normalize_modifier(raw, i, &mut violations))
        .collect();
    modifiers.sort_by(|a, b| (a.chain_priority, a.id.as_str()).cmp(&(b.chain_priority, b.id.as_str())));

    let mut dependencies: Vec<Dependency> = request
        .dependencies
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| normalize_dependency(raw, i, &mut violations))
        .collect();
    dependencies.sort_by(|a, b| {
        (a.depends_on.as_str(), a.modifier_id.as_str())
            .cmp(&(b.depends_on.as_str(), b.modifier_id.as_str()))
    });

    let tax_config = normalize_tax_config(&request.config, &mut violations);

    check_duplicates(&line_items, &modifiers, &mut violations);
    check_references(&modifiers, &dependencies, &request.rules, &mut violations);
    if let Err(CoreError::InvalidInput(mut cycle_violations)) = dependency_depth(&dependencies) {
        violations.append(&mut cycle_violations);
    }

    let mut rule_sources: Vec<(String, Value)> = request
        .rules
        .iter()
        .map(|rule| (rule.modifier_id.clone(), rule.expression.clone()))
        .collect();
    rule_sources.sort_by(|a, b| a.0.cmp(&b.0));

    if !violations.is_empty() {
        return Err(CoreError::InvalidInput(violations).into());
    }

    Ok(NormalizedInput {
        line_items,
        modifiers,
        dependencies,
        // tax_config defaults are only placeholders on the violation
        // path; reaching here means it parsed cleanly.
        tax_config: tax_config.expect("tax config parsed"),
        rule_sources,
    })
}

/// Normalises a batch of raw line items on their own (delta patching).
pub fn normalize_line_items(raw: &[RawLineItem]) -> EngineResult<Vec<LineItem>> {
    let mut violations = Vec::new();
    let items: Vec<LineItem> = raw
        .iter()
        .enumerate()
        .filter_map(|(i, item)| normalize_line_item(item, i, &mut violations))
        .collect();
    if violations.is_empty() {
        Ok(items)
    } else {
        Err(CoreError::InvalidInput(violations).into())
    }
}

/// Normalises a batch of raw modifiers on their own (delta patching).
pub fn normalize_modifiers(raw: &[RawModifier]) -> EngineResult<Vec<Modifier>> {
    let mut violations = Vec::new();
    let modifiers: Vec<Modifier> = raw
        .iter()
        .enumerate()
        .filter_map(|(i, modifier)| normalize_modifier(modifier, i, &mut violations))
        .collect();
    if violations.is_empty() {
        Ok(modifiers)
    } else {
        Err(CoreError::InvalidInput(violations).into())
    }
}

// =============================================================================
// Per-Entity Normalisers
// =============================================================================

fn normalize_line_item(
    raw: &RawLineItem,
    index: usize,
    violations: &mut Vec<Violation>,
) -> Option<LineItem> {
    let field = |name: &str| format!("lineItems[{index}].{name}");

    if raw.id.trim().is_empty() {
        violations.push(Violation::new(field("id"), "id must not be empty"));
        return None;
    }

    let unit_price = decimal_field(&raw.unit_price, &field("unitPrice"), violations);
    let quantity = decimal_field(&raw.quantity, &field("quantity"), violations);
    let cost = match &raw.cost {
        None => Some(None),
        Some(Value::Null) => Some(None),
        Some(value) => decimal_field(value, &field("cost"), violations).map(Some),
    };

    let tax_setting = match raw.tax_setting.as_deref() {
        None => Some(TaxSetting::Taxable),
        Some(token) => parse_token::<TaxSetting>(token, &field("taxSetting"), violations),
    };

    Some(LineItem {
        id: raw.id.clone(),
        unit_price: unit_price?,
        quantity: quantity?,
        cost: cost?,
        tax_setting: tax_setting?,
        use_tax_eligible: raw.use_tax_eligible,
        vendor_tax_collected: raw.vendor_tax_collected,
    })
}

fn normalize_modifier(
    raw: &RawModifier,
    index: usize,
    violations: &mut Vec<Violation>,
) -> Option<Modifier> {
    let field = |name: &str| format!("modifiers[{index}].{name}");

    if raw.id.trim().is_empty() {
        violations.push(Violation::new(field("id"), "id must not be empty"));
        return None;
    }

    let kind = parse_token::<ModifierKind>(&raw.kind, &field("kind"), violations);
    let value = decimal_field(&raw.value, &field("value"), violations);
    let category = parse_token::<ModifierCategory>(&raw.category, &field("category"), violations);

    let tax_setting = match raw.tax_setting.as_deref() {
        None => Some(ModifierTaxSetting::Inherit),
        Some(token) => parse_token::<ModifierTaxSetting>(token, &field("taxSetting"), violations),
    };
    let application_type = match raw.application_type.as_deref() {
        None => Some(ApplicationType::PreTax),
        Some(token) => parse_token::<ApplicationType>(token, &field("applicationType"), violations),
    };
    let missing_cost_strategy = match raw.missing_cost_strategy.as_deref() {
        None => Some(MissingCostStrategy::Skip),
        Some(token) => {
            parse_token::<MissingCostStrategy>(token, &field("missingCostStrategy"), violations)
        }
    };
    let cost_percentage = match &raw.cost_percentage {
        None => Some(None),
        Some(Value::Null) => Some(None),
        Some(value) => decimal_field(value, &field("costPercentage"), violations).map(Some),
    };

    Some(Modifier {
        id: raw.id.clone(),
        kind: kind?,
        value: value?,
        tax_setting: tax_setting?,
        category: category?,
        affects_quantity: raw.affects_quantity,
        cost_percentage: cost_percentage?,
        display_mode: raw.display_mode.clone().unwrap_or_else(|| "standard".to_string()),
        application_type: application_type?,
        product_id: raw.product_id.clone(),
        chain_priority: raw.chain_priority.unwrap_or(DEFAULT_CHAIN_PRIORITY),
        line_item_id: raw.line_item_id.clone(),
        created_at: raw.created_at,
        missing_cost_strategy: missing_cost_strategy?,
    })
}

fn normalize_dependency(
    raw: &RawDependency,
    index: usize,
    violations: &mut Vec<Violation>,
) -> Option<Dependency> {
    let dependency_type = parse_token::<DependencyType>(
        &raw.dependency_type,
        &format!("dependencies[{index}].type"),
        violations,
    )?;
    Some(Dependency {
        modifier_id: raw.modifier_id.clone(),
        depends_on: raw.depends_on.clone(),
        dependency_type,
    })
}

fn normalize_tax_config(
    raw: &RawTaxConfig,
    violations: &mut Vec<Violation>,
) -> Option<TaxConfig> {
    let mode = parse_token::<TaxMode>(&raw.mode, "config.mode", violations);

    let retail_rate = match &raw.retail_rate {
        None => Some(rust_decimal::Decimal::ZERO),
        Some(value) => decimal_field(value, "config.retailRate", violations),
    };
    let use_tax_rate = match &raw.use_tax_rate {
        None => Some(rust_decimal::Decimal::ZERO),
        Some(value) => decimal_field(value, "config.useTaxRate", violations),
    };

    let jurisdictions: Vec<Jurisdiction> = raw
        .jurisdictions
        .iter()
        .enumerate()
        .filter_map(|(i, j)| normalize_jurisdiction(j, i, violations))
        .collect();

    if raw.schema_version.trim().is_empty() {
        violations.push(Violation::new("config.schemaVersion", "missing schema version"));
    }

    Some(TaxConfig {
        mode: mode?,
        retail_rate: retail_rate?,
        use_tax_rate: use_tax_rate?,
        jurisdictions,
        schema_version: raw.schema_version.clone(),
    })
}

fn normalize_jurisdiction(
    raw: &RawJurisdiction,
    index: usize,
    violations: &mut Vec<Violation>,
) -> Option<Jurisdiction> {
    let rate = decimal_field(
        &raw.rate,
        &format!("config.jurisdictions[{index}].rate"),
        violations,
    )?;
    Some(Jurisdiction {
        code: raw.code.clone(),
        order: raw.order,
        rate,
    })
}

// =============================================================================
// Integrity Checks
// =============================================================================

fn check_duplicates(
    line_items: &[LineItem],
    modifiers: &[Modifier],
    violations: &mut Vec<Violation>,
) {
    // Arrays are sorted; duplicates are adjacent.
    for window in line_items.windows(2) {
        if window[0].id == window[1].id {
            violations.push(Violation::new(
                "lineItems",
                format!("duplicate line item id '{}'", window[0].id),
            ));
        }
    }

    let mut ids: Vec<&str> = modifiers.iter().map(|m| m.id.as_str()).collect();
    ids.sort_unstable();
    for window in ids.windows(2) {
        if window[0] == window[1] {
            violations.push(Violation::new(
                "modifiers",
                format!("duplicate modifier id '{}'", window[0]),
            ));
        }
    }
}

fn check_references(
    modifiers: &[Modifier],
    dependencies: &[Dependency],
    rules: &[RawRule],
    violations: &mut Vec<Violation>,
) {
    let known: std::collections::HashSet<&str> = modifiers.iter().map(|m| m.id.as_str()).collect();

    for (i, dep) in dependencies.iter().enumerate() {
        if !known.contains(dep.modifier_id.as_str()) {
            violations.push(Violation::new(
                format!("dependencies[{i}].modifierId"),
                format!("unknown modifier '{}'", dep.modifier_id),
            ));
        }
    }

    for (i, rule) in rules.iter().enumerate() {
        if !known.contains(rule.modifier_id.as_str()) {
            violations.push(Violation::new(
                format!("rules[{i}].modifierId"),
                format!("unknown modifier '{}'", rule.modifier_id),
            ));
        }
    }
}

// =============================================================================
// Token Parsing
// =============================================================================

/// Parses an enum token through its serde rename, so the wire grammar
/// has exactly one definition (the type's derive).
fn parse_token<T: serde::de::DeserializeOwned>(
    token: &str,
    field: &str,
    violations: &mut Vec<Violation>,
) -> Option<T> {
    match serde_json::from_value(Value::String(token.to_string())) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            violations.push(Violation::new(field, format!("unknown value '{token}'")));
            None
        }
    }
}

// =============================================================================
// Snapshot Conversion
// =============================================================================

/// Rebuilds a raw request from a stored snapshot, for requests that
/// arrive without inline payloads. Tax config and context still come
/// from the request; the store holds no tax configuration.
pub fn request_from_snapshot(
    original: &CalculateRequest,
    snapshot: &ProposalSnapshot,
) -> CalculateRequest {
    CalculateRequest {
        proposal_id: original.proposal_id.clone(),
        tenant: original
            .tenant
            .clone()
            .or_else(|| snapshot.proposal.tenant_id.clone()),
        line_items: snapshot
            .line_items
            .iter()
            .map(|row| RawLineItem {
                id: row.id.clone(),
                unit_price: Value::String(row.unit_price.clone()),
                quantity: Value::String(row.quantity.clone()),
                cost: row.cost.clone().map(Value::String),
                tax_setting: Some(row.tax_setting.clone()),
                use_tax_eligible: row.use_tax_eligible,
                vendor_tax_collected: row.vendor_tax_collected,
            })
            .collect(),
        modifiers: snapshot
            .modifiers
            .iter()
            .map(|row| RawModifier {
                id: row.id.clone(),
                kind: row.kind.clone(),
                value: Value::String(row.value.clone()),
                tax_setting: Some(row.tax_setting.clone()),
                category: row.category.clone(),
                affects_quantity: row.affects_quantity,
                cost_percentage: row.cost_percentage.clone().map(Value::String),
                display_mode: Some(row.display_mode.clone()),
                application_type: Some(row.application_type.clone()),
                product_id: row.product_id.clone(),
                chain_priority: Some(row.chain_priority),
                line_item_id: row.line_item_id.clone(),
                created_at: row.created_at,
                missing_cost_strategy: Some(row.missing_cost_strategy.clone()),
            })
            .collect(),
        dependencies: snapshot
            .dependencies
            .iter()
            .map(|row| RawDependency {
                modifier_id: row.modifier_id.clone(),
                depends_on: row.depends_on.clone(),
                dependency_type: row.dependency_type.clone(),
            })
            .collect(),
        rules: snapshot
            .rules
            .iter()
            .map(|row| RawRule {
                modifier_id: row.modifier_id.clone(),
                expression: row.expression.clone(),
            })
            .collect(),
        config: original.config.clone(),
        context: merge_context(&original.context, &snapshot.proposal.metadata),
        changes: None,
    }
}

/// Folds the stored proposal metadata under `proposal.*` in the rule
/// context, keeping request-supplied keys on top.
fn merge_context(request_context: &Value, proposal_metadata: &Value) -> Value {
    let mut merged = match request_context {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if proposal_metadata.is_object() && !merged.contains_key("proposal") {
        merged.insert("proposal".to_string(), proposal_metadata.clone());
    }
    Value::Object(merged)
}

// =============================================================================
// Unit Tests
// =============================================================================
