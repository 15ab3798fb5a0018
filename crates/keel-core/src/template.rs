//! Template rendering.
//!
//! Placeholders have the form `{{ path.to.value }}` with optional filters:
//!
//! - `{{ image.tag | default "latest" }}`: value used when the path is absent
//! - `{{ greeting | quote }}`: emit the value as a quoted string
//!
//! The roots `chart.*` (`name`, `version`, `appVersion`) and `release.*`
//! (`name`, `namespace`) are reserved. Mappings and sequences are emitted as
//! inline JSON, which YAML accepts as flow style.
//!
//! An unknown path is always an error; nothing renders as an empty string.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::chart::{Chart, Template};
use crate::error::{CoreError, CoreResult};
use crate::resource::{self, RenderedResource};
use crate::values::ValueTree;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("placeholder pattern is valid"));

static PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").expect("path pattern is valid")
});

/// Release identity visible to templates as `release.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseContext {
    pub name: String,
    pub namespace: String,
}

impl ReleaseContext {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Context used when rendering without a release, e.g. `keel render`.
    pub fn preview(chart: &Chart) -> Self {
        Self::new(chart.name(), "default")
    }
}

/// A parsed `{{ ... }}` expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Placeholder {
    pub path: String,
    pub default: Option<Value>,
    pub quote: bool,
}

impl Placeholder {
    pub fn is_builtin(&self) -> bool {
        self.path.starts_with("chart.") || self.path.starts_with("release.")
    }
}

/// Every placeholder in a template, in source order.
pub(crate) fn scan(template: &Template) -> CoreResult<Vec<Placeholder>> {
    PLACEHOLDER
        .captures_iter(&template.source)
        .map(|caps| parse_expr(&template.name, &caps[1]))
        .collect()
}

/// Render every template of `chart` with a preview release context.
pub fn render(chart: &Chart, values: &ValueTree) -> CoreResult<Vec<RenderedResource>> {
    render_release(chart, values, &ReleaseContext::preview(chart))
}

/// Render every template of `chart` against `values`.
///
/// Output order is declaration order: templates in chart order, documents
/// in file order. References are resolved across the whole pass.
pub fn render_release(
    chart: &Chart,
    values: &ValueTree,
    release: &ReleaseContext,
) -> CoreResult<Vec<RenderedResource>> {
    if !resource::is_valid_namespace(&release.namespace) {
        return Err(CoreError::InvalidNamespace(release.namespace.clone()));
    }
    let mut resources = Vec::new();
    let mut raw_refs = Vec::new();

    for template in &chart.templates {
        let text = substitute(template, chart, values, release)?;
        for (index, doc) in serde_yaml::Deserializer::from_str(&text).enumerate() {
            let body = Value::deserialize(doc).map_err(|e| CoreError::Template {
                template: template.name.clone(),
                message: format!("document {index}: {e}"),
            })?;
            match body {
                Value::Null => continue,
                Value::Object(_) => {}
                _ => {
                    return Err(CoreError::Template {
                        template: template.name.clone(),
                        message: format!("document {index} is not a mapping"),
                    });
                }
            }
            let (res, refs) = RenderedResource::from_document(&template.name, body)?;
            resources.push(res);
            raw_refs.push(refs);
        }
    }

    resource::link(&mut resources, raw_refs)?;
    debug!(
        chart = %chart.name(),
        release = %release.name,
        resources = resources.len(),
        "chart rendered"
    );
    Ok(resources)
}

/// Serialize rendered resources as a multi-document YAML manifest.
pub fn to_manifest(resources: &[RenderedResource]) -> CoreResult<String> {
    let mut out = String::new();
    for res in resources {
        let yaml = serde_yaml::to_string(&res.body).map_err(|e| CoreError::Template {
            template: res.template.clone(),
            message: e.to_string(),
        })?;
        out.push_str("---\n# Source: ");
        out.push_str(&res.template);
        out.push('\n');
        out.push_str(&yaml);
    }
    Ok(out)
}

fn substitute(
    template: &Template,
    chart: &Chart,
    values: &ValueTree,
    release: &ReleaseContext,
) -> CoreResult<String> {
    let mut out = String::with_capacity(template.source.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(&template.source) {
        let Some(whole) = caps.get(0) else { continue };
        let placeholder = parse_expr(&template.name, &caps[1])?;
        let value = lookup(&placeholder, chart, values, release).ok_or_else(|| {
            CoreError::UnresolvedReference {
                template: template.name.clone(),
                path: placeholder.path.clone(),
            }
        })?;
        out.push_str(&template.source[last..whole.start()]);
        out.push_str(&format_value(&value, placeholder.quote));
        last = whole.end();
    }
    out.push_str(&template.source[last..]);
    Ok(out)
}

fn lookup(
    placeholder: &Placeholder,
    chart: &Chart,
    values: &ValueTree,
    release: &ReleaseContext,
) -> Option<Value> {
    let found = match placeholder.path.as_str() {
        "chart.name" => Some(Value::String(chart.name().to_string())),
        "chart.version" => Some(Value::String(chart.version().to_string())),
        "chart.appVersion" => Some(Value::String(chart.app_version().to_string())),
        "release.name" => Some(Value::String(release.name.clone())),
        "release.namespace" => Some(Value::String(release.namespace.clone())),
        _ if placeholder.is_builtin() => None,
        path => values.lookup(path).cloned(),
    };
    found.or_else(|| placeholder.default.clone())
}

fn format_value(value: &Value, quote: bool) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    };
    if quote {
        Value::String(text).to_string()
    } else {
        text
    }
}

fn parse_expr(template: &str, expr: &str) -> CoreResult<Placeholder> {
    let mut parts = expr.split('|').map(str::trim);
    let path = parts.next().unwrap_or_default().to_string();
    if !PATH.is_match(&path) {
        return Err(CoreError::Template {
            template: template.to_string(),
            message: format!("invalid placeholder `{{{{ {expr} }}}}`"),
        });
    }

    let mut placeholder = Placeholder {
        path,
        default: None,
        quote: false,
    };
    for filter in parts {
        let (name, arg) = filter
            .split_once(char::is_whitespace)
            .map(|(n, a)| (n, a.trim()))
            .unwrap_or((filter, ""));
        match (name, arg) {
            ("quote", "") => placeholder.quote = true,
            ("default", arg) if !arg.is_empty() => {
                let value = serde_yaml::from_str::<Value>(arg).map_err(|e| CoreError::Template {
                    template: template.to_string(),
                    message: format!("invalid default `{arg}`: {e}"),
                })?;
                placeholder.default = Some(value);
            }
            _ => {
                return Err(CoreError::Template {
                    template: template.to_string(),
                    message: format!("unknown filter `{filter}` in `{{{{ {expr} }}}}`"),
                });
            }
        }
    }
    Ok(placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartMetadata;
    use serde_json::json;

    const CLIENT: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: client-config
data:
  issuer: {{ global.issuerUrl | quote }}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: client
  labels:
    chart: {{ chart.name }}-{{ chart.version }}
spec:
  replicas: {{ client.replicas | default 1 }}
  selector:
    matchLabels: {{ client.labels }}
  template:
    metadata:
      labels: {{ client.labels }}
    spec:
      containers:
        - name: client
          image: "{{ client.image.repository }}:{{ client.image.tag }}"
      volumes:
        - name: config
          configMap:
            name: client-config
"#;

    fn chart(source: &str) -> Chart {
        Chart::new(
            ChartMetadata {
                name: "platform".to_string(),
                version: "0.3.0".to_string(),
                app_version: "1.4.2".to_string(),
                description: None,
            },
            ValueTree::new(),
            vec![Template::new("templates/client.yaml", source)],
        )
        .unwrap()
    }

    fn values() -> ValueTree {
        ValueTree::from_value(
            "test",
            json!({
                "global": { "issuerUrl": "https://id.example.com/realms/main" },
                "client": {
                    "labels": { "app": "client" },
                    "image": { "repository": "registry.local/client", "tag": "abc123" }
                }
            }),
        )
        .unwrap()
    }

    #[test]
    fn renders_values_builtins_and_defaults() {
        let resources = render(&chart(CLIENT), &values()).unwrap();

        assert_eq!(resources.len(), 2);
        let deployment = &resources[1].body;
        assert_eq!(deployment["metadata"]["labels"]["chart"], json!("platform-0.3.0"));
        assert_eq!(deployment["spec"]["replicas"], json!(1));
        assert_eq!(deployment["spec"]["selector"]["matchLabels"], json!({ "app": "client" }));
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("registry.local/client:abc123")
        );
        assert_eq!(resources[0].body["data"]["issuer"], json!("https://id.example.com/realms/main"));
        assert_eq!(resources[1].references.len(), 1);
    }

    #[test]
    fn unknown_path_is_an_error_not_an_empty_string() {
        let mut values = values();
        values.merge(&ValueTree::from_value("test", json!({ "client": { "image": null } })).unwrap());

        let err = render(&chart(CLIENT), &values).unwrap_err();
        match err {
            CoreError::UnresolvedReference { template, path } => {
                assert_eq!(template, "templates/client.yaml");
                assert_eq!(path, "client.image.repository");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rendering_is_byte_identical_across_runs() {
        let chart = chart(CLIENT);
        let first = to_manifest(&render(&chart, &values()).unwrap()).unwrap();
        let second = to_manifest(&render(&chart, &values()).unwrap()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("---\n# Source: templates/client.yaml\n"));
    }

    #[test]
    fn release_context_is_visible() {
        let source = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: "{{ release.name }}-settings"
  namespace: {{ release.namespace }}
"#;
        let ctx = ReleaseContext::new("shop", "staging");
        let resources = render_release(&chart(source), &ValueTree::new(), &ctx).unwrap();
        assert_eq!(resources[0].name(), "shop-settings");
        assert_eq!(resources[0].namespace.as_deref(), Some("staging"));
    }

    #[test]
    fn release_namespace_must_be_a_dns_label() {
        let source = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n";
        let ctx = ReleaseContext::new("shop", "../prod");
        let err = render_release(&chart(source), &ValueTree::new(), &ctx).unwrap_err();
        assert!(matches!(err, CoreError::InvalidNamespace(ref ns) if ns == "../prod"));
    }

    #[test]
    fn unknown_builtin_is_unresolved() {
        let source = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ chart.owner }}\n";
        let err = render(&chart(source), &ValueTree::new()).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedReference { ref path, .. } if path == "chart.owner"));
    }

    #[test]
    fn rejects_unknown_filters_and_bad_paths() {
        let err = parse_expr("t", "image.tag | upper").unwrap_err();
        assert!(err.to_string().contains("unknown filter"));
        assert!(parse_expr("t", "image..tag").is_err());
        assert!(parse_expr("t", "").is_err());
    }

    #[test]
    fn empty_documents_are_skipped() {
        let source = "---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n";
        let resources = render(&chart(source), &ValueTree::new()).unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn non_mapping_document_is_rejected() {
        let err = render(&chart("- just\n- a list\n"), &ValueTree::new()).unwrap_err();
        assert!(matches!(err, CoreError::Template { .. }));
    }
}
