//! Structural three-way diff and JSON merge patch.
//!
//! A diff compares the desired document against the live object and the
//! body Keel last applied for the same resource. Fields the desired
//! document sets are patched when they differ. Fields that were last
//! applied but are no longer desired are removed with a `null`. Fields
//! that exist only on the live object (runtime-owned status, uids,
//! defaults filled in by the cluster) were never applied by Keel, so
//! patching never touches them.

use serde_json::{Map, Value};

/// Fields that differ between a desired and a live document.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Merge patch carrying only the differing fields.
    pub patch: Value,
    /// Dotted paths of the patched or removed fields, in document order.
    pub fields: Vec<String>,
}

/// Compare `desired` against `live`, given the body `last_applied` by the
/// previous deployed revision. Returns `None` when nothing needs sending.
///
/// Mappings are compared key by key; sequences and scalars are replaced
/// as a whole. A `null` in `desired` means "no opinion" and is skipped,
/// unless the key was last applied, in which case it is removed.
pub fn diff(desired: &Value, live: &Value, last_applied: Option<&Value>) -> Option<Diff> {
    let mut fields = Vec::new();
    let patch = match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            let last = last_applied.and_then(Value::as_object);
            diff_map(want, have, last, "", &mut fields)?
        }
        _ if desired == live => return None,
        _ => {
            fields.push(String::new());
            desired.clone()
        }
    };
    Some(Diff { patch, fields })
}

fn diff_map(
    want: &Map<String, Value>,
    have: &Map<String, Value>,
    last: Option<&Map<String, Value>>,
    prefix: &str,
    fields: &mut Vec<String>,
) -> Option<Value> {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    let mut patch = Map::new();
    for (key, desired) in want {
        if desired.is_null() {
            continue;
        }
        let path = join(key);
        match (desired, have.get(key)) {
            (Value::Object(w), Some(Value::Object(h))) => {
                let last = last.and_then(|l| l.get(key)).and_then(Value::as_object);
                if let Some(nested) = diff_map(w, h, last, &path, fields) {
                    patch.insert(key.clone(), nested);
                }
            }
            (d, Some(h)) if d == h => {}
            (d, _) => {
                fields.push(path);
                patch.insert(key.clone(), strip_nulls(d));
            }
        }
    }
    if let Some(last) = last {
        for key in last.keys() {
            let dropped = want.get(key).is_none_or(Value::is_null);
            if dropped && have.contains_key(key) {
                fields.push(join(key));
                patch.insert(key.clone(), Value::Null);
            }
        }
    }
    if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    }
}

// Nulls inside a new subtree would read as deletions in a merge patch.
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
