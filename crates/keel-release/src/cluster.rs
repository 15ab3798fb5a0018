//! Target cluster API.
//!
//! The apply engine only needs get, create, merge-patch and a readiness
//! check per `(kind, name, namespace)`. Backends implement [`ClusterApi`];
//! [`MemoryCluster`](crate::MemoryCluster) and
//! [`FileCluster`](crate::FileCluster) ship with the crate.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use keel_core::RenderedResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Address of one object in the target cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Key for a rendered resource. `metadata.namespace` wins over the
    /// release namespace.
    pub fn for_resource(resource: &RenderedResource, release_namespace: &str) -> Self {
        Self::new(
            resource.namespace.as_deref().unwrap_or(release_namespace),
            resource.kind(),
            resource.name(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("{key} rejected: {reason}")]
    Rejected { key: ObjectKey, reason: String },

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored object {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Object-level operations against a target cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Current state of the object, or `None` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError>;

    /// Create an object that does not exist yet.
    async fn create(&self, key: &ObjectKey, body: &Value) -> Result<(), ClusterError>;

    /// Apply a JSON merge patch to an existing object.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<(), ClusterError>;

    /// Whether the object has reached its ready condition.
    async fn is_ready(&self, key: &ObjectKey) -> Result<bool, ClusterError>;
}
