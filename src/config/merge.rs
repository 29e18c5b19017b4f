//! Configuration merge logic
//!
//! Layers merge with:
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)
//!
//! The same rule combines executor layers (`[executors.defaults]`,
//! `[executors.<category>.defaults]`, the instance table), so a `mounts` or
//! `options` list on an instance replaces the inherited one.

use serde_json::Value;

/// Deep merge two JSON values; `overlay` wins.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        // Arrays, scalars, null: overlay replaces
        (_, overlay) => overlay,
    }
}

/// Merge layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}
