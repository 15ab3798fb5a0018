//! Environment configuration.
//!
//! The registry endpoint, target cluster and identity-provider issuer URL are
//! environment-scoped. They enter the value tree under `global.*` so
//! templates reference them instead of hardcoding them:
//!
//! ```toml
//! name = "staging"
//! registry = "registry.staging.example.com"
//! cluster = "staging-eu-1"
//! issuer_url = "https://id.example.com/realms/staging"
//!
//! [values.gateway]
//! replicas = 2
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::values::ValueTree;

/// Per-environment inputs to the value store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub registry: Option<String>,
    pub cluster: Option<String>,
    pub issuer_url: Option<String>,
    /// Extra per-environment value overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<toml::Table>,
}

impl EnvironmentConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(path.display(), e))?;
        let config: EnvironmentConfig = toml::from_str(&content)
            .map_err(|e| CoreError::InvalidConfig(format!("{}: {e}", path.display())))?;
        if config.name.trim().is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "{}: name must not be empty",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Read `KEEL_ENV`, `KEEL_REGISTRY`, `KEEL_CLUSTER` and `KEEL_ISSUER_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            name: non_empty("KEEL_ENV").unwrap_or_else(|| "default".to_string()),
            registry: non_empty("KEEL_REGISTRY"),
            cluster: non_empty("KEEL_CLUSTER"),
            issuer_url: non_empty("KEEL_ISSUER_URL"),
            values: None,
        }
    }

    /// The environment layer of the value tree.
    pub fn to_values(&self) -> CoreResult<ValueTree> {
        let mut global = Map::new();
        global.insert("environment".to_string(), Value::String(self.name.clone()));
        for (key, value) in [
            ("registry", &self.registry),
            ("cluster", &self.cluster),
            ("issuerUrl", &self.issuer_url),
        ] {
            if let Some(v) = value {
                global.insert(key.to_string(), Value::String(v.clone()));
            }
        }

        let mut tree = match &self.values {
            Some(table) => {
                let value = serde_json::to_value(table)
                    .map_err(|e| CoreError::InvalidConfig(format!("values: {e}")))?;
                ValueTree::from_value(&format!("environment {}", self.name), value)?
            }
            None => ValueTree::new(),
        };
        let mut root = Map::new();
        root.insert("global".to_string(), Value::Object(global));
        tree.merge(&ValueTree::from_value("environment", Value::Object(root))?);
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_file_and_projects_global_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.toml");
        std::fs::write(
            &path,
            r#"
name = "staging"
registry = "registry.staging.example.com"
cluster = "staging-eu-1"
issuer_url = "https://id.example.com/realms/staging"

[values.gateway]
replicas = 2
"#,
        )
        .unwrap();

        let config = EnvironmentConfig::from_file(&path).unwrap();
        let values = config.to_values().unwrap();

        assert_eq!(values.lookup("global.environment"), Some(&json!("staging")));
        assert_eq!(values.lookup("global.registry"), Some(&json!("registry.staging.example.com")));
        assert_eq!(values.lookup("global.cluster"), Some(&json!("staging-eu-1")));
        assert_eq!(
            values.lookup("global.issuerUrl"),
            Some(&json!("https://id.example.com/realms/staging"))
        );
        assert_eq!(values.lookup("gateway.replicas"), Some(&json!(2)));
    }

    #[test]
    fn lookup_skips_empty_variables() {
        let config = EnvironmentConfig::from_lookup(|key| match key {
            "KEEL_ENV" => Some("prod".to_string()),
            "KEEL_REGISTRY" => Some("  ".to_string()),
            "KEEL_CLUSTER" => Some("prod-1".to_string()),
            _ => None,
        });
        assert_eq!(config.name, "prod");
        assert!(config.registry.is_none());
        assert_eq!(config.cluster.as_deref(), Some("prod-1"));

        let values = config.to_values().unwrap();
        assert!(values.lookup("global.registry").is_none());
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.toml");
        std::fs::write(&path, "name = \"\"\n").unwrap();
        assert!(matches!(
            EnvironmentConfig::from_file(&path),
            Err(CoreError::InvalidConfig(_))
        ));
    }
}
