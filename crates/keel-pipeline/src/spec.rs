//! Pipeline definition (`keel-pipeline.toml`).
//!
//! ```toml
//! name = "platform"
//! release = "platform"
//! namespace = "shop"
//! chart = "chart"
//! environment = "env/staging.toml"
//! branches = ["main"]
//!
//! [[service]]
//! name = "client"
//! context = "services/client"
//! command = ["make", "image"]
//! repository = "shop/client"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

fn default_namespace() -> String {
    "default".to_string()
}

/// One build unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Source tree handed to the builder.
    pub context: PathBuf,
    /// Build command, run inside `context`.
    #[serde(default)]
    pub command: Vec<String>,
    /// Image repository within the environment's registry.
    pub repository: String,
    /// Values path the built image is written under. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_key: Option<String>,
}

impl ServiceSpec {
    pub fn values_key(&self) -> &str {
        self.values_key.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    /// Release the deploy job upgrades.
    pub release: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Chart directory.
    pub chart: PathBuf,
    /// Environment config file. Falls back to `KEEL_*` variables when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<PathBuf>,
    /// Branches whose events start a run. Empty means any branch.
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
}

impl PipelineSpec {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse(&text, path, base)
    }

    /// Parse `text`; `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path, base: &Path) -> PipelineResult<Self> {
        let invalid = |message: String| PipelineError::InvalidSpec {
            path: origin.to_path_buf(),
            message,
        };
        let mut spec: PipelineSpec = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        spec.validate().map_err(invalid)?;

        spec.chart = base.join(&spec.chart);
        spec.environment = spec.environment.map(|env| base.join(env));
        for service in &mut spec.services {
            service.context = base.join(&service.context);
        }
        Ok(spec)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        keel_state::validate_name(&self.release).map_err(|e| e.to_string())?;
        if self.services.is_empty() {
            return Err("at least one [[service]] is required".to_string());
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(format!("service {} is declared twice", service.name));
            }
            if service.repository.trim().is_empty() {
                return Err(format!("service {}: repository must not be empty", service.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
name = "platform"
release = "platform"
namespace = "shop"
chart = "chart"
environment = "env/staging.toml"
branches = ["main"]

[[service]]
name = "client"
context = "services/client"
command = ["make", "image"]
repository = "shop/client"

[[service]]
name = "account"
context = "services/account"
repository = "shop/account"
values_key = "accountService"
"#;

    #[test]
    fn parses_and_resolves_paths() {
        let spec = PipelineSpec::parse(SPEC, Path::new("keel-pipeline.toml"), Path::new("/repo")).unwrap();
        assert_eq!(spec.namespace, "shop");
        assert_eq!(spec.chart, PathBuf::from("/repo/chart"));
        assert_eq!(spec.environment, Some(PathBuf::from("/repo/env/staging.toml")));
        assert_eq!(spec.services.len(), 2);
        assert_eq!(spec.services[0].context, PathBuf::from("/repo/services/client"));
        assert_eq!(spec.services[0].values_key(), "client");
        assert_eq!(spec.services[1].values_key(), "accountService");
        assert!(spec.services[1].command.is_empty());
    }

    #[test]
    fn namespace_defaults() {
        let text = "name = \"p\"\nrelease = \"p\"\nchart = \"c\"\n[[service]]\nname = \"a\"\ncontext = \".\"\nrepository = \"a\"\n";
        let spec = PipelineSpec::parse(text, Path::new("p.toml"), Path::new(".")).unwrap();
        assert_eq!(spec.namespace, "default");
        assert!(spec.branches.is_empty());
    }

    #[test]
    fn rejects_duplicate_services_and_bad_release_names() {
        let dup = SPEC.replace("name = \"account\"", "name = \"client\"");
        let err = PipelineSpec::parse(&dup, Path::new("p.toml"), Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("declared twice"));

        let bad = SPEC.replace("release = \"platform\"", "release = \"Platform\"");
        assert!(PipelineSpec::parse(&bad, Path::new("p.toml"), Path::new(".")).is_err());

        let none = "name = \"p\"\nrelease = \"p\"\nchart = \"c\"\n";
        assert!(PipelineSpec::parse(none, Path::new("p.toml"), Path::new(".")).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel-pipeline.toml");
        std::fs::write(&path, SPEC).unwrap();
        let spec = PipelineSpec::from_file(&path).unwrap();
        assert_eq!(spec.chart, dir.path().join("chart"));
    }
}
