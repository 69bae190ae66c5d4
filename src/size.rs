//! Payload size estimation.
//!
//! Batches are bounded by an approximate byte ceiling. Serializing every
//! candidate payload just to measure it would cost more than the bound is
//! worth, so the estimate walks the value tree instead: strings cost their
//! character length, scalars a fixed constant, containers the sum of their
//! elements. The result is a heuristic, not an exact wire size.

use serde_json::Value;

/// Flat cost charged for null, booleans, and numbers.
pub(crate) const SCALAR_COST: usize = 8;

/// Estimate the byte cost of a value tree without serializing it.
pub fn estimated_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => SCALAR_COST,
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(estimated_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.chars().count() + estimated_size(v)).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_cost_a_constant() {
        assert_eq!(estimated_size(&json!(null)), SCALAR_COST);
        assert_eq!(estimated_size(&json!(true)), SCALAR_COST);
        assert_eq!(estimated_size(&json!(42)), SCALAR_COST);
        assert_eq!(estimated_size(&json!(3.14)), SCALAR_COST);
    }

    #[test]
    fn strings_cost_their_length() {
        assert_eq!(estimated_size(&json!("")), 0);
        assert_eq!(estimated_size(&json!("hello")), 5);
        // Characters, not encoded bytes.
        assert_eq!(estimated_size(&json!("héllo")), 5);
    }

    #[test]
    fn arrays_sum_their_elements() {
        assert_eq!(estimated_size(&json!([])), 0);
        assert_eq!(estimated_size(&json!(["ab", "cd"])), 4);
        assert_eq!(estimated_size(&json!([1, 2, 3])), 3 * SCALAR_COST);
    }

    #[test]
    fn objects_sum_keys_and_values() {
        let value = json!({"name": "ada", "age": 36});
        // "name" (4) + "ada" (3) + "age" (3) + number (8)
        assert_eq!(estimated_size(&value), 4 + 3 + 3 + SCALAR_COST);
    }

    #[test]
    fn nested_trees_recurse() {
        let value = json!({
            "tags": ["a", "bb"],
            "meta": {"ok": true},
        });
        // "tags" (4) + "a" (1) + "bb" (2) + "meta" (4) + "ok" (2) + bool (8)
        assert_eq!(estimated_size(&value), 4 + 1 + 2 + 4 + 2 + SCALAR_COST);
    }
}
