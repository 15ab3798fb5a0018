//! Error types for value resolution, rendering and ordering.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised before anything touches a cluster.
///
/// Every variant names the template, resource or reference path at fault.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unresolved reference `{path}` in template {template}")]
    UnresolvedReference { template: String, path: String },

    #[error("invalid resource {resource}: {field} {reason}")]
    InvalidResource {
        resource: String,
        field: String,
        reason: String,
    },

    #[error("resource {resource} references {reference}, which is not part of this render")]
    DanglingReference { resource: String, reference: String },

    #[error("dependency cycle between resources: {}", participants.join(" -> "))]
    DependencyCycle { participants: Vec<String> },

    #[error("template {template}: {message}")]
    Template { template: String, message: String },

    #[error("invalid values in {source_name}: {message}")]
    InvalidValues { source_name: String, message: String },

    #[error("invalid chart {path}: {message}")]
    InvalidChart { path: String, message: String },

    #[error("invalid environment config: {0}")]
    InvalidConfig(String),

    #[error("invalid namespace `{0}`: use lowercase letters, digits and '-', at most 63 characters")]
    InvalidNamespace(String),

    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// True for errors caused by a reference cycle between resources.
    pub fn is_cycle(&self) -> bool {
        matches!(self, CoreError::DependencyCycle { .. })
    }

    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}
