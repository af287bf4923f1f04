//! Deep merge of JSON configuration layers.

use serde_json::{Map, Value};

/// Merges `overlay` on top of `base`.
///
/// Objects are merged key by key, recursively. Scalars and arrays in the
/// overlay replace the base value wholesale. A `null` in the overlay means
/// "absent" and leaves the base value untouched.
///
/// # Example
///
/// ```
/// use bloxer::config::deep_merge;
/// use serde_json::json;
///
/// let merged = deep_merge(
///     json!({ "logger": { "name": "Base", "level": "info" }, "persist": true }),
///     json!({ "logger": { "level": "debug" }, "persist": null }),
/// );
/// assert_eq!(merged, json!({ "logger": { "name": "Base", "level": "debug" }, "persist": true }));
/// ```
#[must_use]
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (base, Value::Null) => base,
        (Value::Object(mut target), Value::Object(source)) => {
            for (key, value) in source {
                if value.is_null() {
                    continue;
                }
                let merged = match target.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                target.insert(key, merged);
            }
            Value::Object(target)
        }
        (_, overlay) => overlay,
    }
}

/// Folds `layers` into one object, lowest priority first.
#[must_use]
pub fn merge_layers<I>(layers: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    layers
        .into_iter()
        .fold(Value::Object(Map::new()), deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_merge() {
        let merged = deep_merge(
            json!({ "a": { "b": 1, "c": 2 } }),
            json!({ "a": { "c": 3, "d": 4 } }),
        );
        assert_eq!(merged, json!({ "a": { "b": 1, "c": 3, "d": 4 } }));
    }

    #[test]
    fn test_arrays_replaced_wholesale() {
        let merged = deep_merge(json!({ "list": [1, 2, 3] }), json!({ "list": [9] }));
        assert_eq!(merged, json!({ "list": [9] }));
    }

    #[test]
    fn test_scalar_replaces_object() {
        let merged = deep_merge(json!({ "a": { "b": 1 } }), json!({ "a": "flat" }));
        assert_eq!(merged, json!({ "a": "flat" }));
    }

    #[test]
    fn test_null_is_skipped() {
        let merged = deep_merge(json!({ "a": 1, "b": 2 }), json!({ "a": null, "b": 5 }));
        assert_eq!(merged, json!({ "a": 1, "b": 5 }));
    }

    #[test]
    fn test_merge_layers_priority() {
        let merged = merge_layers([
            json!({ "startingBlock": 0, "persist": true }),
            json!({ "startingBlock": 10 }),
            json!({ "startingBlock": 20, "persist": false }),
        ]);
        assert_eq!(merged, json!({ "startingBlock": 20, "persist": false }));
    }

    #[test]
    fn test_base_not_mutated_by_overlay_keys() {
        let base = json!({ "logger": { "name": "Bloxer Indexer" } });
        let merged = deep_merge(base.clone(), json!({ "wsUrl": "ws://node" }));
        assert_eq!(merged["logger"], base["logger"]);
        assert_eq!(merged["wsUrl"], "ws://node");
    }
}
