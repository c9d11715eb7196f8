//! JSON merge-patch (RFC 7396)

use serde_json::{Map, Value};

/// Apply `patch` onto `target` in place.
///
/// Objects merge key by key, `null` removes a key, arrays and scalars
/// replace wholesale. A non-object patch replaces the whole target.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Non-mutating form of [`merge_patch`].
pub fn merged(base: &Value, patch: &Value) -> Value {
    let mut out = base.clone();
    merge_patch(&mut out, patch);
    out
}
