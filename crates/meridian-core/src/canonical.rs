//! # Canonical Encoding
//!
//! Byte-stable serialisation of JSON-shaped values.
//!
//! Two values that are semantically equal must encode to identical bytes,
//! regardless of how their mappings were built or which order their keys
//! were inserted in. The rules:
//!
//! - Mapping keys are sorted lexicographically (byte-wise), recursively
//! - Array order is preserved
//! - Numbers are rendered as their decimal string (monetary values arrive
//!   here already rendered as Q7/Q2 strings; raw JSON numbers keep their
//!   original text - `serde_json`'s `arbitrary_precision` feature
//!   guarantees no float round-trip)
//! - No whitespace
//!
//! The canonicaliser's output is the **only** byte stream that ever feeds
//! a fingerprint. See [`crate::fingerprint`].

use serde_json::Value;
use std::collections::BTreeMap;

/// Encodes a value into its canonical byte-stable form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // BTreeMap gives the lexicographic key order for free.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(val, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's escaping is the JSON spec's escaping; reuse it rather
    // than maintaining a second escape table.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let a = json!({"b": {"z": 1, "a": 2}, "a": true});
        assert_eq!(canonical_json(&a), r#"{"a":true,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2], "z": "s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"z": "s", "x": 1, "y": [1, 2]}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_array_order_preserved() {
        let a = json!([3, 1, 2]);
        assert_eq!(canonical_json(&a), "[3,1,2]");
    }

    #[test]
    fn test_number_text_survives() {
        // With arbitrary_precision the original number text is kept; a
        // high-precision literal must not collapse through f64.
        let v: Value = serde_json::from_str(r#"{"rate": 0.0000001}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"rate":0.0000001}"#);
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"note": "line\nbreak \"quoted\""});
        assert_eq!(
            canonical_json(&v),
            r#"{"note":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let v = json!({"a": [1, {"b": null}]});
        assert_eq!(canonical_json(&v), r#"{"a":[1,{"b":null}]}"#);
    }
}
