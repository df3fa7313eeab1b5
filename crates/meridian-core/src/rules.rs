//! # Safe Rule Evaluation
//!
//! Modifier applicability rules are boolean expression **trees**, never
//! strings. This module compiles a JSON-shaped expression into a typed
//! AST, enforces the safety limits, and interprets the AST against a
//! read-only context.
//!
//! ## Safety Envelope
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  COMPILE TIME (per rule)              EVAL TIME (per evaluation)        │
//! │                                                                         │
//! │  depth        ≤ 10                    depth      ≤ 10                   │
//! │  nodes        ≤ 100                   operations ≤ 1000                 │
//! │  field paths  ≤ 20 distinct                                             │
//! │  every path root in the allow-list:                                     │
//! │    proposal.* computed.* customer.* project.* running.*                 │
//! │    evaluationContext.*                                                  │
//! │                                                                         │
//! │  No reflection. No dynamic dispatch beyond tagged unions.               │
//! │  No string is ever evaluated as code. Unknown paths resolve to a       │
//! │  missing sentinel - lookup never fails.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shape
//! ```json
//! {"all": [
//!   {"op": "gte", "left": {"field": "computed.subtotal"}, "right": {"value": "500"}},
//!   {"any": [
//!     {"op": "eq", "left": {"field": "customer.segment"}, "right": {"value": "enterprise"}},
//!     {"op": "in", "left": {"field": "proposal.region"}, "right": {"value": ["us", "ca"]}}
//!   ]}
//! ]}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde_json::Value;

use crate::decimal::parse_decimal;
use crate::error::{CoreError, CoreResult};

// =============================================================================
// Limits
// =============================================================================

/// Maximum AST depth, at compile and at eval time.
pub const MAX_RULE_DEPTH: usize = 10;

/// Maximum AST node count per rule.
pub const MAX_RULE_NODES: usize = 100;

/// Maximum distinct field paths per rule.
pub const MAX_RULE_PATHS: usize = 20;

/// Maximum interpreter operations per evaluation.
pub const MAX_EVAL_OPS: usize = 1_000;

/// Path roots a rule is allowed to address.
pub const ALLOWED_PATH_ROOTS: &[&str] = &[
    "proposal",
    "computed",
    "customer",
    "project",
    "running",
    "evaluationContext",
];

// =============================================================================
// Context Values
// =============================================================================

/// A read-only value in the evaluation context.
///
/// Tagged union, nothing else: rules can inspect these shapes and no
/// others. `Missing` is what unknown paths resolve to.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    /// An unknown path. Comparisons against it are always false.
    Missing,
    Null,
    Bool(bool),
    Number(Decimal),
    Text(String),
    List(Vec<RuleValue>),
    Map(BTreeMap<String, RuleValue>),
}

impl RuleValue {
    /// Builds a context value from JSON. Numbers become decimals through
    /// their text form; no float path exists.
    pub fn from_json(value: &Value) -> RuleValue {
        match value {
            Value::Null => RuleValue::Null,
            Value::Bool(b) => RuleValue::Bool(*b),
            Value::Number(n) => match parse_decimal(&n.to_string()) {
                Ok(d) => RuleValue::Number(d),
                Err(_) => RuleValue::Missing,
            },
            Value::String(s) => RuleValue::Text(s.clone()),
            Value::Array(items) => {
                RuleValue::List(items.iter().map(RuleValue::from_json).collect())
            }
            Value::Object(map) => RuleValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), RuleValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Resolves a path against this value. Unknown segments yield
    /// `Missing`; this never fails.
    fn lookup(&self, path: &[String]) -> RuleValue {
        let mut current = self;
        for segment in path {
            current = match current {
                RuleValue::Map(map) => match map.get(segment) {
                    Some(v) => v,
                    None => return RuleValue::Missing,
                },
                RuleValue::List(items) => match segment.parse::<usize>() {
                    Ok(idx) => match items.get(idx) {
                        Some(v) => v,
                        None => return RuleValue::Missing,
                    },
                    Err(_) => return RuleValue::Missing,
                },
                _ => return RuleValue::Missing,
            };
        }
        current.clone()
    }

    fn truthy(&self) -> bool {
        match self {
            RuleValue::Missing | RuleValue::Null => false,
            RuleValue::Bool(b) => *b,
            RuleValue::Number(d) => !d.is_zero(),
            RuleValue::Text(s) => !s.is_empty(),
            RuleValue::List(items) => !items.is_empty(),
            RuleValue::Map(_) => true,
        }
    }

    /// Numeric view used by comparisons: numbers directly, numeric text
    /// by parsing. Everything else has no numeric view.
    fn as_number(&self) -> Option<Decimal> {
        match self {
            RuleValue::Number(d) => Some(*d),
            RuleValue::Text(s) => parse_decimal(s).ok(),
            _ => None,
        }
    }
}

// =============================================================================
// AST
// =============================================================================

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Left value is a member of the right list.
    In,
    /// Left list contains the right value, or left text contains right text.
    Contains,
}

/// A compiled rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleExpr {
    Literal(RuleValue),
    Field(Vec<String>),
    Compare {
        op: CompareOp,
        left: Box<RuleExpr>,
        right: Box<RuleExpr>,
    },
    /// Logical AND, short-circuit.
    All(Vec<RuleExpr>),
    /// Logical OR, short-circuit.
    Any(Vec<RuleExpr>),
}

/// A compiled rule bound to the modifier it filters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub modifier_id: String,
    pub expr: RuleExpr,
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles and validates a JSON-shaped rule expression.
///
/// ## Errors
/// `RULE_COMPILE_ERROR` on: unknown operator, malformed node, depth over
/// [`MAX_RULE_DEPTH`], more than [`MAX_RULE_NODES`] nodes, more than
/// [`MAX_RULE_PATHS`] distinct paths, or a path outside the allow-list.
pub fn compile_rule(modifier_id: &str, source: &Value) -> CoreResult<CompiledRule> {
    let mut stats = CompileStats::default();
    let expr = parse_expr(modifier_id, source, 1, &mut stats)?;

    if stats.paths.len() > MAX_RULE_PATHS {
        return Err(compile_err(
            modifier_id,
            format!(
                "{} distinct field paths, limit {MAX_RULE_PATHS}",
                stats.paths.len()
            ),
        ));
    }

    Ok(CompiledRule {
        modifier_id: modifier_id.to_string(),
        expr,
    })
}

#[derive(Default)]
struct CompileStats {
    nodes: usize,
    paths: BTreeSet<String>,
}

fn compile_err(modifier_id: &str, reason: impl Into<String>) -> CoreError {
    CoreError::RuleCompile {
        modifier_id: modifier_id.to_string(),
        reason: reason.into(),
    }
}

fn parse_expr(
    modifier_id: &str,
    source: &Value,
    depth: usize,
    stats: &mut CompileStats,
) -> CoreResult<RuleExpr> {
    if depth > MAX_RULE_DEPTH {
        return Err(compile_err(
            modifier_id,
            format!("expression deeper than {MAX_RULE_DEPTH}"),
        ));
    }
    stats.nodes += 1;
    if stats.nodes > MAX_RULE_NODES {
        return Err(compile_err(
            modifier_id,
            format!("more than {MAX_RULE_NODES} nodes"),
        ));
    }

    let obj = source
        .as_object()
        .ok_or_else(|| compile_err(modifier_id, "expression node must be an object"))?;

    if let Some(branches) = obj.get("all") {
        return parse_branches(modifier_id, branches, depth, stats).map(RuleExpr::All);
    }
    if let Some(branches) = obj.get("any") {
        return parse_branches(modifier_id, branches, depth, stats).map(RuleExpr::Any);
    }
    if let Some(path) = obj.get("field") {
        return parse_field(modifier_id, path);
    }
    if let Some(literal) = obj.get("value") {
        return Ok(RuleExpr::Literal(RuleValue::from_json(literal)));
    }
    if let Some(op) = obj.get("op") {
        let op = parse_op(modifier_id, op)?;
        let left = obj
            .get("left")
            .ok_or_else(|| compile_err(modifier_id, "comparison missing 'left'"))?;
        let right = obj
            .get("right")
            .ok_or_else(|| compile_err(modifier_id, "comparison missing 'right'"))?;
        return Ok(RuleExpr::Compare {
            op,
            left: Box::new(parse_expr(modifier_id, left, depth + 1, stats)?),
            right: Box::new(parse_expr(modifier_id, right, depth + 1, stats)?),
        });
    }

    Err(compile_err(
        modifier_id,
        "expression node must carry one of: all, any, op, field, value",
    ))
}

fn parse_branches(
    modifier_id: &str,
    source: &Value,
    depth: usize,
    stats: &mut CompileStats,
) -> CoreResult<Vec<RuleExpr>> {
    let items = source
        .as_array()
        .ok_or_else(|| compile_err(modifier_id, "'all'/'any' must carry an array"))?;
    items
        .iter()
        .map(|item| parse_expr(modifier_id, item, depth + 1, stats))
        .collect()
}

fn parse_field(modifier_id: &str, path: &Value) -> CoreResult<RuleExpr> {
    let text = path
        .as_str()
        .ok_or_else(|| compile_err(modifier_id, "'field' must be a dotted string"))?;
    let segments: Vec<String> = text.split('.').map(str::to_string).collect();

    if segments.is_empty() || segments.iter().any(String::is_empty) {
        return Err(compile_err(modifier_id, format!("malformed path '{text}'")));
    }
    if !ALLOWED_PATH_ROOTS.contains(&segments[0].as_str()) {
        return Err(compile_err(
            modifier_id,
            format!("path root '{}' is not allowed", segments[0]),
        ));
    }

    Ok(RuleExpr::Field(segments))
}

fn parse_op(modifier_id: &str, op: &Value) -> CoreResult<CompareOp> {
    let name = op
        .as_str()
        .ok_or_else(|| compile_err(modifier_id, "'op' must be a string"))?;
    match name {
        "eq" => Ok(CompareOp::Eq),
        "ne" => Ok(CompareOp::Ne),
        "lt" => Ok(CompareOp::Lt),
        "lte" => Ok(CompareOp::Le),
        "gt" => Ok(CompareOp::Gt),
        "gte" => Ok(CompareOp::Ge),
        "in" => Ok(CompareOp::In),
        "contains" => Ok(CompareOp::Contains),
        other => Err(compile_err(modifier_id, format!("unknown operator '{other}'"))),
    }
}

// =============================================================================
// Interpreter
// =============================================================================

/// Evaluates a compiled rule against a context.
///
/// The context is read-only; evaluation consumes at most
/// [`MAX_EVAL_OPS`] operations and recurses at most
/// [`MAX_RULE_DEPTH`] levels, else `RULE_EVAL_ERROR`.
pub fn evaluate(rule: &CompiledRule, context: &RuleValue) -> CoreResult<bool> {
    let mut ops = 0usize;
    let value = eval_expr(&rule.expr, context, 1, &mut ops)?;
    Ok(value.truthy())
}

fn eval_expr(
    expr: &RuleExpr,
    context: &RuleValue,
    depth: usize,
    ops: &mut usize,
) -> CoreResult<RuleValue> {
    if depth > MAX_RULE_DEPTH {
        return Err(CoreError::RuleEval {
            reason: format!("evaluation deeper than {MAX_RULE_DEPTH}"),
        });
    }
    *ops += 1;
    if *ops > MAX_EVAL_OPS {
        return Err(CoreError::RuleEval {
            reason: format!("evaluation exceeded {MAX_EVAL_OPS} operations"),
        });
    }

    match expr {
        RuleExpr::Literal(value) => Ok(value.clone()),
        RuleExpr::Field(path) => Ok(context.lookup(path)),
        RuleExpr::All(branches) => {
            for branch in branches {
                if !eval_expr(branch, context, depth + 1, ops)?.truthy() {
                    return Ok(RuleValue::Bool(false));
                }
            }
            Ok(RuleValue::Bool(true))
        }
        RuleExpr::Any(branches) => {
            for branch in branches {
                if eval_expr(branch, context, depth + 1, ops)?.truthy() {
                    return Ok(RuleValue::Bool(true));
                }
            }
            Ok(RuleValue::Bool(false))
        }
        RuleExpr::Compare { op, left, right } => {
            let lhs = eval_expr(left, context, depth + 1, ops)?;
            let rhs = eval_expr(right, context, depth + 1, ops)?;
            Ok(RuleValue::Bool(compare(*op, &lhs, &rhs)))
        }
    }
}

fn compare(op: CompareOp, lhs: &RuleValue, rhs: &RuleValue) -> bool {
    // Missing never satisfies anything, including Ne: a rule must not
    // accidentally pass because a field does not exist.
    if matches!(lhs, RuleValue::Missing) || matches!(rhs, RuleValue::Missing) {
        return false;
    }

    match op {
        CompareOp::Eq => values_equal(lhs, rhs),
        CompareOp::Ne => !values_equal(lhs, rhs),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (lhs.as_number(), rhs.as_number()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => match (lhs, rhs) {
                    (RuleValue::Text(a), RuleValue::Text(b)) => a.cmp(b),
                    _ => return false,
                },
            };
            match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        CompareOp::In => match rhs {
            RuleValue::List(items) => items.iter().any(|item| values_equal(lhs, item)),
            _ => false,
        },
        CompareOp::Contains => match (lhs, rhs) {
            (RuleValue::List(items), needle) => {
                items.iter().any(|item| values_equal(item, needle))
            }
            (RuleValue::Text(haystack), RuleValue::Text(needle)) => haystack.contains(needle),
            _ => false,
        },
    }
}

fn values_equal(lhs: &RuleValue, rhs: &RuleValue) -> bool {
    // Numeric equality crosses the text/number boundary ("10" == 10.0)
    // because context values are decimals while rule literals are often
    // written as strings.
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return a == b;
    }
    lhs == rhs
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RuleValue {
        RuleValue::from_json(&json!({
            "computed": {"subtotal": "525.00", "lineItemCount": 2},
            "proposal": {"region": "us"},
            "customer": {"segment": "enterprise", "tags": ["vip", "net30"]}
        }))
    }

    fn compile(v: serde_json::Value) -> CompiledRule {
        compile_rule("m1", &v).unwrap()
    }

    #[test]
    fn test_comparison_against_context() {
        let rule = compile(json!({
            "op": "gte",
            "left": {"field": "computed.subtotal"},
            "right": {"value": "500"}
        }));
        assert!(evaluate(&rule, &ctx()).unwrap());
    }

    #[test]
    fn test_all_short_circuit_and_any() {
        let rule = compile(json!({"all": [
            {"op": "eq", "left": {"field": "proposal.region"}, "right": {"value": "us"}},
            {"any": [
                {"op": "eq", "left": {"field": "customer.segment"}, "right": {"value": "smb"}},
                {"op": "contains", "left": {"field": "customer.tags"}, "right": {"value": "vip"}}
            ]}
        ]}));
        assert!(evaluate(&rule, &ctx()).unwrap());
    }

    #[test]
    fn test_in_operator() {
        let rule = compile(json!({
            "op": "in",
            "left": {"field": "proposal.region"},
            "right": {"value": ["us", "ca"]}
        }));
        assert!(evaluate(&rule, &ctx()).unwrap());
    }

    #[test]
    fn test_missing_path_is_false_never_error() {
        let rule = compile(json!({
            "op": "eq",
            "left": {"field": "customer.unknown.deep"},
            "right": {"value": "x"}
        }));
        assert!(!evaluate(&rule, &ctx()).unwrap());

        // Ne must not pass on a missing field either.
        let rule = compile(json!({
            "op": "ne",
            "left": {"field": "customer.unknown"},
            "right": {"value": "x"}
        }));
        assert!(!evaluate(&rule, &ctx()).unwrap());
    }

    #[test]
    fn test_path_allow_list_enforced() {
        let err = compile_rule(
            "m1",
            &json!({"op": "eq", "left": {"field": "secrets.key"}, "right": {"value": 1}}),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::RuleCompile { .. }));
        assert_eq!(err.kind(), "RULE_COMPILE_ERROR");
    }

    #[test]
    fn test_depth_limit_rejected_at_compile() {
        // Nest 11 levels of "all".
        let mut node = json!({"value": true});
        for _ in 0..11 {
            node = json!({"all": [node]});
        }
        assert!(compile_rule("m1", &node).is_err());
    }

    #[test]
    fn test_node_count_limit() {
        let branches: Vec<_> = (0..101).map(|_| json!({"value": true})).collect();
        assert!(compile_rule("m1", &json!({"all": branches})).is_err());
    }

    #[test]
    fn test_distinct_path_limit() {
        let branches: Vec<_> = (0..21)
            .map(|i| {
                json!({"op": "eq", "left": {"field": format!("computed.f{i}")}, "right": {"value": 1}})
            })
            .collect();
        assert!(compile_rule("m1", &json!({"all": branches})).is_err());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = compile_rule(
            "m1",
            &json!({"op": "regex", "left": {"field": "proposal.id"}, "right": {"value": ".*"}}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "RULE_COMPILE_ERROR");
    }

    #[test]
    fn test_numeric_text_equality() {
        let rule = compile(json!({
            "op": "eq",
            "left": {"field": "computed.lineItemCount"},
            "right": {"value": "2"}
        }));
        assert!(evaluate(&rule, &ctx()).unwrap());
    }
}
