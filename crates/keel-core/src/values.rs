//! Value trees and precedence-ordered merging.
//!
//! A [`ValueTree`] is the resolved configuration a chart renders against.
//! Layers are merged key-path-wise: mappings merge recursively, scalars and
//! sequences replace wholesale, and an explicit `null` removes the key.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::chart::Chart;
use crate::error::{CoreError, CoreResult};
use crate::template;

/// A resolved hierarchical value set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueTree(Map<String, Value>);

impl ValueTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value. `null` yields an empty tree; anything other than a
    /// mapping is rejected.
    pub fn from_value(source_name: &str, value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(CoreError::InvalidValues {
                source_name: source_name.to_string(),
                message: format!("top level must be a mapping, found {}", type_name(&other)),
            }),
        }
    }

    /// Parse a YAML document into a tree.
    pub fn from_yaml_str(source_name: &str, text: &str) -> CoreResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: Value = serde_yaml::from_str(text).map_err(|e| CoreError::InvalidValues {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        Self::from_value(source_name, value)
    }

    /// Load a YAML values file.
    pub fn from_yaml_file(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path.display(), e))?;
        Self::from_yaml_str(&path.display().to_string(), &text)
    }

    /// Build a partial tree from a `path.to.key=value` expression.
    ///
    /// The right-hand side is read as a YAML scalar, so `replicas=3` yields a
    /// number and `enabled=true` a boolean. Unparseable input stays a string.
    pub fn from_set_expr(expr: &str) -> CoreResult<Self> {
        let (path, raw) = expr.split_once('=').ok_or_else(|| CoreError::InvalidValues {
            source_name: "--set".to_string(),
            message: format!("expected path=value, got `{expr}`"),
        })?;
        let path = path.trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(CoreError::InvalidValues {
                source_name: "--set".to_string(),
                message: format!("invalid key path in `{expr}`"),
            });
        }

        let leaf = if raw.is_empty() {
            Value::String(String::new())
        } else {
            serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };

        let mut node = leaf;
        for segment in path.rsplit('.') {
            let mut map = Map::new();
            map.insert(segment.to_string(), node);
            node = Value::Object(map);
        }
        Self::from_value("--set", node)
    }

    /// Merge `overlay` into this tree; overlay wins per leaf.
    ///
    /// A `null` anywhere in the overlay deletes that key instead of being
    /// stored.
    pub fn merge(&mut self, overlay: &ValueTree) {
        merge_maps(&mut self.0, &overlay.0);
    }

    /// Look up a dotted path. Numeric segments index into sequences.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Merge `overrides` over `defaults` in the order supplied.
pub fn resolve(defaults: &ValueTree, overrides: &[ValueTree]) -> ValueTree {
    let mut resolved = defaults.clone();
    for layer in overrides {
        resolved.merge(layer);
    }
    debug!(layers = overrides.len() + 1, keys = resolved.0.len(), "values resolved");
    resolved
}

/// Resolve against a chart's defaults and check that every placeholder in
/// the chart either has a value or declares a default.
pub fn resolve_for_chart(chart: &Chart, overrides: &[ValueTree]) -> CoreResult<ValueTree> {
    let resolved = resolve(&chart.defaults, overrides);
    for tmpl in &chart.templates {
        for placeholder in template::scan(tmpl)? {
            if placeholder.is_builtin() || placeholder.default.is_some() {
                continue;
            }
            if resolved.lookup(&placeholder.path).is_none() {
                return Err(CoreError::UnresolvedReference {
                    template: tmpl.name.clone(),
                    path: placeholder.path,
                });
            }
        }
    }
    Ok(resolved)
}

fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (_, Value::Null) => {
                base.remove(key);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming);
            }
            (_, Value::Object(incoming)) => {
                let mut fresh = Map::new();
                merge_maps(&mut fresh, incoming);
                base.insert(key.clone(), Value::Object(fresh));
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
