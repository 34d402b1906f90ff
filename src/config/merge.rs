//! Deep merge and `{env: VAR}` substitution for YAML configuration trees.
//!
//! Fragments are parsed into `serde_json::Value` trees and merged
//! field-by-field, later fragments taking precedence:
//!
//! - mappings merge recursively, key by key;
//! - arrays are replaced wholesale by the overlay's array;
//! - scalars (including `null`) are replaced wholesale.
//!
//! A `null` overlay value replaces the base value. Unresolved `{env: VAR}`
//! references become `null`, so an overlay pointing at an unset variable
//! clears the inherited value rather than silently keeping it.

use serde_json::{Map, Value};
use tracing::warn;

use super::env_vars::EnvVars;

/// Deep merge `overlay` onto `base`, returning the merged value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            Value::Object(merge_maps(base_map, overlay_map))
        }
        (_, overlay) => overlay,
    }
}

/// Deep merge two mappings, `overlay` winning on conflicts.
pub fn merge_maps(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, overlay_value) in overlay {
        let merged = match overlay_value {
            Value::Object(overlay_child) => {
                let existing = match base.remove(&key) {
                    Some(Value::Object(existing)) => existing,
                    _ => Map::new(),
                };
                Value::Object(merge_maps(existing, overlay_child))
            }
            other => other,
        };
        base.insert(key, merged);
    }
    base
}

/// Merge a sequence of mappings in order, later ones taking precedence.
pub fn merge_all(layers: impl IntoIterator<Item = Map<String, Value>>) -> Map<String, Value> {
    layers.into_iter().fold(Map::new(), merge_maps)
}

/// Replace every one-key `{env: "VAR"}` mapping in `value` with the value
/// of `VAR` from `env`.
///
/// Unset variables resolve to `null` and log a warning naming the dotted
/// path of the reference (array indices included).
pub fn resolve_env_references(value: Value, env: &EnvVars) -> Value {
    let mut path = Vec::new();
    resolve_at(value, env, &mut path)
}

fn resolve_at(value: Value, env: &EnvVars, path: &mut Vec<String>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    path.push(index.to_string());
                    let resolved = resolve_at(item, env, path);
                    path.pop();
                    resolved
                })
                .collect(),
        ),
        Value::Object(map) => {
            if let Some(var) = env_reference(&map) {
                return match env.get(var) {
                    Some(resolved) => Value::String(resolved.to_string()),
                    None => {
                        let label = if path.is_empty() {
                            "<root>".to_string()
                        } else {
                            path.join(".")
                        };
                        warn!("Missing env {} at {}", var, label);
                        Value::Null
                    }
                };
            }

            let mut resolved = Map::with_capacity(map.len());
            for (key, nested) in map {
                path.push(key.clone());
                let value = resolve_at(nested, env, path);
                path.pop();
                resolved.insert(key, value);
            }
            Value::Object(resolved)
        }
        other => other,
    }
}

/// The variable name when `map` is exactly `{env: "<name>"}`.
fn env_reference(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get("env").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_merge_nested_objects() {
        let base = json!({
            "server": {"host": "localhost", "port": 8080},
            "debug": true
        });
        let overlay = json!({"server": {"port": 9000}});
        assert_eq!(
            deep_merge(base, overlay),
            json!({
                "server": {"host": "localhost", "port": 9000},
                "debug": true
            })
        );
    }

    #[test]
    fn test_arrays_replaced_not_concatenated() {
        let base = json!({"tags": ["a", "b"]});
        let overlay = json!({"tags": ["c"]});
        assert_eq!(deep_merge(base, overlay), json!({"tags": ["c"]}));
    }

    #[test]
    fn test_array_of_objects_not_merged_by_index() {
        let base = json!({"links": [{"href": "/a", "label": "A"}]});
        let overlay = json!({"links": [{"href": "/b"}]});
        assert_eq!(
            deep_merge(base, overlay),
            json!({"links": [{"href": "/b"}]})
        );
    }

    #[test]
    fn test_null_overlay_replaces_base() {
        let base = json!({"db": {"password": "old"}});
        let overlay = json!({"db": {"password": null}});
        assert_eq!(
            deep_merge(base, overlay),
            json!({"db": {"password": null}})
        );
    }

    #[test]
    fn test_object_replaces_scalar_and_scalar_replaces_object() {
        let base = json!({"a": 1, "b": {"nested": true}});
        let overlay = json!({"a": {"x": 1}, "b": "flat"});
        assert_eq!(
            deep_merge(base, overlay),
            json!({"a": {"x": 1}, "b": "flat"})
        );
    }

    #[test]
    fn test_merge_all_precedence() {
        let merged = merge_all([
            object(json!({"api": "base", "keep": 1})),
            object(json!({"api": "env"})),
            object(json!({"api": "region"})),
            object(json!({"api": "host"})),
        ]);
        assert_eq!(Value::Object(merged), json!({"api": "host", "keep": 1}));
    }

    #[test]
    fn test_resolve_env_reference() {
        let env = EnvVars::from_pairs([("DB_PASS", "secret")]);
        let value = json!({"db": {"password": {"env": "DB_PASS"}}});
        assert_eq!(
            resolve_env_references(value, &env),
            json!({"db": {"password": "secret"}})
        );
    }

    #[test]
    fn test_resolve_env_reference_unset_becomes_null() {
        let value = json!({"db": {"password": {"env": "DB_PASS"}}});
        assert_eq!(
            resolve_env_references(value, &EnvVars::default()),
            json!({"db": {"password": null}})
        );
    }

    #[test]
    fn test_resolve_env_reference_inside_array() {
        let env = EnvVars::from_pairs([("TOKEN", "t0k")]);
        let value = json!({"hooks": [{"token": {"env": "TOKEN"}}, "plain"]});
        assert_eq!(
            resolve_env_references(value, &env),
            json!({"hooks": [{"token": "t0k"}, "plain"]})
        );
    }

    #[test]
    fn test_env_mapping_with_extra_keys_is_left_alone() {
        let env = EnvVars::from_pairs([("X", "1")]);
        let value = json!({"opt": {"env": "X", "default": "2"}});
        assert_eq!(resolve_env_references(value.clone(), &env), value);
    }

    #[test]
    fn test_env_mapping_with_non_string_value_is_left_alone() {
        let value = json!({"opt": {"env": 3}});
        assert_eq!(
            resolve_env_references(value.clone(), &EnvVars::default()),
            value
        );
    }
}
