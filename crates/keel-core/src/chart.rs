//! Chart loading.
//!
//! A chart directory looks like:
//!
//! ```text
//! platform/
//!   Chart.toml        name, version, app_version
//!   values.yaml       default values (optional)
//!   templates/*.yaml  manifest templates, loaded in path order
//! ```
//!
//! Files under `templates/` whose name starts with `_` are skipped.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};
use crate::values::ValueTree;

/// `Chart.toml` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    /// Packaging revision of the chart itself (semver).
    pub version: String,
    /// Revision of the application the chart deploys.
    #[serde(alias = "appVersion")]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named manifest template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub source: String,
}

impl Template {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// A versioned bundle of templates plus default values.
///
/// Template order is declaration order; it breaks ties when ordering
/// rendered resources.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub defaults: ValueTree,
    pub templates: Vec<Template>,
}

impl Chart {
    pub fn new(
        metadata: ChartMetadata,
        defaults: ValueTree,
        templates: Vec<Template>,
    ) -> CoreResult<Self> {
        validate_metadata(&metadata, &metadata.name)?;
        Ok(Self {
            metadata,
            defaults,
            templates,
        })
    }

    /// Load a chart from a directory.
    pub fn from_dir(dir: &Path) -> CoreResult<Self> {
        let chart_toml = dir.join("Chart.toml");
        let text = std::fs::read_to_string(&chart_toml)
            .map_err(|e| CoreError::io(chart_toml.display(), e))?;
        let metadata: ChartMetadata = toml::from_str(&text).map_err(|e| CoreError::InvalidChart {
            path: chart_toml.display().to_string(),
            message: e.to_string(),
        })?;

        let values_path = dir.join("values.yaml");
        let defaults = if values_path.is_file() {
            ValueTree::from_yaml_file(&values_path)?
        } else {
            ValueTree::new()
        };

        let templates_dir = dir.join("templates");
        let mut templates = Vec::new();
        if templates_dir.is_dir() {
            for entry in WalkDir::new(&templates_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| CoreError::InvalidChart {
                    path: templates_dir.display().to_string(),
                    message: e.to_string(),
                })?;
                if !entry.file_type().is_file() || !is_template_file(entry.path()) {
                    continue;
                }
                let source = std::fs::read_to_string(entry.path())
                    .map_err(|e| CoreError::io(entry.path().display(), e))?;
                let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                templates.push(Template::new(name, source));
            }
        }

        if templates.is_empty() {
            return Err(CoreError::InvalidChart {
                path: dir.display().to_string(),
                message: "no templates found".to_string(),
            });
        }

        let chart = Chart::new(metadata, defaults, templates)?;
        debug!(
            chart = %chart.metadata.name,
            version = %chart.metadata.version,
            templates = chart.templates.len(),
            "chart loaded"
        );
        Ok(chart)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn app_version(&self) -> &str {
        &self.metadata.app_version
    }
}

fn validate_metadata(metadata: &ChartMetadata, path: &str) -> CoreResult<()> {
    if metadata.name.trim().is_empty() {
        return Err(CoreError::InvalidChart {
            path: path.to_string(),
            message: "name must not be empty".to_string(),
        });
    }
    semver::Version::parse(&metadata.version).map_err(|e| CoreError::InvalidChart {
        path: path.to_string(),
        message: format!("version `{}` is not semver: {e}", metadata.version),
    })?;
    if metadata.app_version.trim().is_empty() {
        return Err(CoreError::InvalidChart {
            path: path.to_string(),
            message: "app_version must not be empty".to_string(),
        });
    }
    Ok(())
}

fn is_template_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_') || n.starts_with('.'));
    let yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml");
    yaml && !hidden
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(version: &str) -> ChartMetadata {
        ChartMetadata {
            name: "platform".to_string(),
            version: version.to_string(),
            app_version: "2.4.0".to_string(),
            description: None,
        }
    }

    #[test]
    fn rejects_non_semver_version() {
        let err = Chart::new(metadata("v1"), ValueTree::new(), vec![]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidChart { .. }));
    }

    #[test]
    fn parses_chart_toml_with_camel_case_alias() {
        let meta: ChartMetadata = toml::from_str(
            r#"
name = "platform"
version = "0.3.0"
appVersion = "1.4.2"
"#,
        )
        .unwrap();
        assert_eq!(meta.app_version, "1.4.2");
    }

    #[test]
    fn loads_templates_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Chart.toml"),
            "name = \"platform\"\nversion = \"0.1.0\"\napp_version = \"1.0\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("values.yaml"), "replicas: 2\n").unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("b-service.yaml"), "kind: Service\n").unwrap();
        std::fs::write(templates.join("a-config.yaml"), "kind: ConfigMap\n").unwrap();
        std::fs::write(templates.join("_helpers.yaml"), "ignored: true\n").unwrap();
        std::fs::write(templates.join("NOTES.txt"), "ignored").unwrap();

        let chart = Chart::from_dir(dir.path()).unwrap();

        let names: Vec<_> = chart.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["templates/a-config.yaml", "templates/b-service.yaml"]);
        assert_eq!(chart.defaults.lookup("replicas"), Some(&serde_json::json!(2)));
        assert_eq!(chart.app_version(), "1.0");
    }

    #[test]
    fn chart_without_templates_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Chart.toml"),
            "name = \"empty\"\nversion = \"0.1.0\"\napp_version = \"1.0\"\n",
        )
        .unwrap();
        assert!(matches!(
            Chart::from_dir(dir.path()),
            Err(CoreError::InvalidChart { .. })
        ));
    }
}
