//! Rendered resources, structural validation and reference discovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Annotation holding explicit references: `"ConfigMap/app-config, client"`.
pub const REFERENCES_ANNOTATION: &str = "keel.io/references";

/// Kinds whose pod template is inspected for config and secret references.
const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "Job", "ReplicaSet"];

/// Identity of a resource within one render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A reference as written, before it is matched against the render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `Kind/name`: matches exactly one resource.
    Typed(ResourceId),
    /// Bare `name`: matches every resource carrying that name.
    Named(String),
}

impl Reference {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.split_once('/') {
            Some((kind, name)) => Reference::Typed(ResourceId::new(kind.trim(), name.trim())),
            None => Reference::Named(raw.to_string()),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Typed(id) => id.fmt(f),
            Reference::Named(name) => f.write_str(name),
        }
    }
}

/// A template after substitution: a typed declarative document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedResource {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Template the document came from.
    pub template: String,
    pub body: Value,
    /// Resources this one must be applied after.
    #[serde(default)]
    pub references: Vec<ResourceId>,
}

impl RenderedResource {
    /// Validate a parsed document and wrap it. References stay unresolved
    /// until [`link`] runs over the whole render pass.
    pub fn from_document(template: &str, body: Value) -> CoreResult<(Self, Vec<Reference>)> {
        let kind = required_str(&body, "kind").ok_or_else(|| CoreError::InvalidResource {
            resource: format!("{template} (document without kind)"),
            field: "kind".to_string(),
            reason: "is missing".to_string(),
        })?;
        let name = pointer_str(&body, "/metadata/name").ok_or_else(|| CoreError::InvalidResource {
            resource: format!("{kind} in {template}"),
            field: "metadata.name".to_string(),
            reason: "is missing".to_string(),
        })?;
        let id = ResourceId::new(kind, name);

        validate_identity(&id, &body)?;
        validate(&id, &body)?;

        let namespace = pointer_str(&body, "/metadata/namespace").map(str::to_string);
        let refs = discover_references(&id, &body);
        Ok((
            Self {
                id,
                namespace,
                template: template.to_string(),
                body,
                references: Vec::new(),
            },
            refs,
        ))
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }
}

/// Resolve raw references against the resources of one render pass.
///
/// Rejects duplicate identities and references that match nothing.
pub fn link(resources: &mut [RenderedResource], raw: Vec<Vec<Reference>>) -> CoreResult<()> {
    let mut by_id: HashMap<ResourceId, usize> = HashMap::new();
    let mut by_name: HashMap<String, Vec<ResourceId>> = HashMap::new();
    for (idx, res) in resources.iter().enumerate() {
        if by_id.insert(res.id.clone(), idx).is_some() {
            return Err(CoreError::InvalidResource {
                resource: res.id.to_string(),
                field: "metadata.name".to_string(),
                reason: "is declared more than once".to_string(),
            });
        }
        by_name
            .entry(res.id.name.clone())
            .or_default()
            .push(res.id.clone());
    }

    for (res, refs) in resources.iter_mut().zip(raw) {
        let mut resolved: Vec<ResourceId> = Vec::new();
        for reference in refs {
            let targets: Vec<ResourceId> = match &reference {
                Reference::Typed(id) => {
                    by_id.contains_key(id).then(|| vec![id.clone()]).unwrap_or_default()
                }
                Reference::Named(name) => by_name
                    .get(name)
                    .map(|ids| ids.iter().filter(|id| **id != res.id).cloned().collect())
                    .unwrap_or_default(),
            };
            if targets.is_empty() {
                return Err(CoreError::DanglingReference {
                    resource: res.id.to_string(),
                    reference: reference.to_string(),
                });
            }
            for target in targets {
                if !resolved.contains(&target) {
                    resolved.push(target);
                }
            }
        }
        res.references = resolved;
    }
    Ok(())
}

/// SHA-256 over the canonical JSON of a resource set, hex-encoded.
pub fn manifest_digest(resources: &[RenderedResource]) -> String {
    let mut hasher = Sha256::new();
    for res in resources {
        hasher.update(res.id.to_string().as_bytes());
        hasher.update([0u8]);
        // serde_json maps are sorted, so this is canonical.
        hasher.update(res.body.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// ── Validation ───────────────────────────────────────────────────

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("subdomain pattern is valid")
});
static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("label pattern is valid")
});
static KIND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").expect("kind pattern is valid"));

/// Namespaces are DNS-1123 labels.
pub fn is_valid_namespace(namespace: &str) -> bool {
    namespace.len() <= 63 && DNS_LABEL.is_match(namespace)
}

/// Kind, name and namespace end up in object keys and file paths.
fn validate_identity(id: &ResourceId, body: &Value) -> CoreResult<()> {
    let invalid = |field: &str, reason: &str| CoreError::InvalidResource {
        resource: id.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    };

    if !KIND.is_match(&id.kind) {
        return Err(invalid("kind", "must be alphanumeric and start with a letter"));
    }
    if id.name.len() > 253 || !DNS_SUBDOMAIN.is_match(&id.name) {
        return Err(invalid(
            "metadata.name",
            "must be a DNS-1123 subdomain: lowercase letters, digits, '-' and '.', \
             starting and ending alphanumeric, at most 253 characters",
        ));
    }
    if let Some(namespace) = pointer_str(body, "/metadata/namespace")
        && !is_valid_namespace(namespace)
    {
        return Err(invalid(
            "metadata.namespace",
            "must be a DNS-1123 label: lowercase letters, digits and '-', at most 63 characters",
        ));
    }
    Ok(())
}

fn validate(id: &ResourceId, body: &Value) -> CoreResult<()> {
    let invalid = |field: &str, reason: &str| CoreError::InvalidResource {
        resource: id.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    };

    if required_str(body, "apiVersion").is_none() {
        return Err(invalid("apiVersion", "is missing"));
    }

    match id.kind.as_str() {
        kind if WORKLOAD_KINDS.contains(&kind) => {
            if kind != "Job" && body.pointer("/spec/selector").is_none() {
                return Err(invalid("spec.selector", "is missing"));
            }
            if body.pointer("/spec/template").is_none() {
                return Err(invalid("spec.template", "is missing"));
            }
            let containers = body
                .pointer("/spec/template/spec/containers")
                .and_then(Value::as_array)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    invalid("spec.template.spec.containers", "must list at least one container")
                })?;
            for (i, container) in containers.iter().enumerate() {
                let field = |name: &str| format!("spec.template.spec.containers[{i}].{name}");
                if required_str(container, "name").is_none() {
                    return Err(invalid(&field("name"), "is missing"));
                }
                if required_str(container, "image").is_none() {
                    return Err(invalid(&field("image"), "is missing"));
                }
            }
        }
        "Service" => {
            let ports = body.pointer("/spec/ports").and_then(Value::as_array);
            if ports.is_none_or(|p| p.is_empty()) {
                return Err(invalid("spec.ports", "must list at least one port"));
            }
        }
        "Ingress" => {
            if body.pointer("/spec/rules").is_none()
                && body.pointer("/spec/defaultBackend").is_none()
            {
                return Err(invalid("spec.rules", "is missing (and no spec.defaultBackend)"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn required_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn pointer_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

// ── Reference discovery ──────────────────────────────────────────

fn discover_references(id: &ResourceId, body: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();

    if let Some(raw) = pointer_str(body, "/metadata/annotations/keel.io~1references") {
        refs.extend(raw.split(',').filter_map(Reference::parse));
    }

    let pod_spec = if WORKLOAD_KINDS.contains(&id.kind.as_str()) {
        body.pointer("/spec/template/spec")
    } else if id.kind == "Pod" {
        body.get("spec")
    } else {
        None
    };
    if let Some(pod) = pod_spec {
        pod_references(pod, &mut refs);
    }

    if id.kind == "Ingress" {
        if let Some(name) = pointer_str(body, "/spec/defaultBackend/service/name") {
            refs.push(Reference::Typed(ResourceId::new("Service", name)));
        }
        for rule in array_at(body, "/spec/rules") {
            for path in array_at(rule, "/http/paths") {
                if let Some(name) = pointer_str(path, "/backend/service/name") {
                    refs.push(Reference::Typed(ResourceId::new("Service", name)));
                }
            }
        }
    }

    // Gateway-style routing resources list their backing services by name.
    for backend in array_at(body, "/spec/backends") {
        let name = backend
            .as_str()
            .or_else(|| backend.get("name").and_then(Value::as_str));
        if let Some(reference) = name.and_then(Reference::parse) {
            refs.push(reference);
        }
    }

    let mut unique = Vec::with_capacity(refs.len());
    for r in refs {
        if !unique.contains(&r) {
            unique.push(r);
        }
    }
    unique
}

fn pod_references(pod: &Value, refs: &mut Vec<Reference>) {
    let mut typed = |kind: &str, source: &Value, name_key: &str| {
        if source.get("optional").and_then(Value::as_bool) == Some(true) {
            return;
        }
        if let Some(name) = source.get(name_key).and_then(Value::as_str) {
            refs.push(Reference::Typed(ResourceId::new(kind, name)));
        }
    };

    for volume in array_at(pod, "/volumes") {
        if let Some(cm) = volume.get("configMap") {
            typed("ConfigMap", cm, "name");
        }
        if let Some(secret) = volume.get("secret") {
            typed("Secret", secret, "secretName");
        }
    }

    let containers = array_at(pod, "/initContainers").chain(array_at(pod, "/containers"));
    for container in containers {
        for source in array_at(container, "/envFrom") {
            if let Some(cm) = source.get("configMapRef") {
                typed("ConfigMap", cm, "name");
            }
            if let Some(secret) = source.get("secretRef") {
                typed("Secret", secret, "name");
            }
        }
        for env in array_at(container, "/env") {
            if let Some(cm) = env.pointer("/valueFrom/configMapKeyRef") {
                typed("ConfigMap", cm, "name");
            }
            if let Some(secret) = env.pointer("/valueFrom/secretKeyRef") {
                typed("Secret", secret, "name");
            }
        }
    }
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> + 'a {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}
