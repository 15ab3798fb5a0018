//! Directory-backed cluster backend.
//!
//! Objects live at `<root>/<namespace>/<kind>/<name>.json`. Used by the
//! CLI for local releases; every stored object is immediately ready.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::diff::apply_merge_patch;

pub struct FileCluster {
    root: PathBuf,
}

impl FileCluster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Each key part must be a single plain path segment.
    fn path_for(&self, key: &ObjectKey) -> Result<PathBuf, ClusterError> {
        let parts = [&key.namespace, &key.kind, &key.name];
        let unsafe_part = parts.iter().find(|part| {
            part.is_empty()
                || part.as_str() == "."
                || part.as_str() == ".."
                || part.contains(['/', '\\', '\0'])
        });
        if let Some(part) = unsafe_part {
            return Err(ClusterError::Rejected {
                key: key.clone(),
                reason: format!("`{part}` is not usable as a path segment"),
            });
        }
        Ok(self
            .root
            .join(&key.namespace)
            .join(&key.kind)
            .join(format!("{}.json", key.name)))
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>, ClusterError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ClusterError::Corrupt {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ClusterError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn write(&self, path: &Path, object: &Value) -> Result<(), ClusterError> {
        let io_err = |source| ClusterError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(object).map_err(|e| ClusterError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        // Write-then-rename so a crash never leaves a truncated object.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FileCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError> {
        self.read(&self.path_for(key)?).await
    }

    async fn create(&self, key: &ObjectKey, body: &Value) -> Result<(), ClusterError> {
        let path = self.path_for(key)?;
        if self.read(&path).await?.is_some() {
            return Err(ClusterError::AlreadyExists(key.clone()));
        }
        self.write(&path, body).await?;
        debug!(object = %key, "object created");
        Ok(())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<(), ClusterError> {
        let path = self.path_for(key)?;
        let mut object = self
            .read(&path)
            .await?
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        apply_merge_patch(&mut object, patch);
        self.write(&path, &object).await?;
        debug!(object = %key, "object patched");
        Ok(())
    }

    async fn is_ready(&self, key: &ObjectKey) -> Result<bool, ClusterError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ClusterError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn objects_persist_as_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FileCluster::new(dir.path());
        let key = ObjectKey::new("shop", "Service", "client");

        assert!(cluster.get(&key).await.unwrap().is_none());
        cluster
            .create(&key, &json!({ "kind": "Service", "spec": { "ports": [{ "port": 80 }] } }))
            .await
            .unwrap();
        assert!(dir.path().join("shop/Service/client.json").exists());
        assert!(cluster.is_ready(&key).await.unwrap());

        cluster
            .patch(&key, &json!({ "spec": { "type": "ClusterIP" } }))
            .await
            .unwrap();
        let reopened = FileCluster::new(dir.path());
        let object = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(object["spec"]["type"], "ClusterIP");
        assert_eq!(object["spec"]["ports"][0]["port"], 80);
    }

    #[tokio::test]
    async fn keys_that_escape_the_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FileCluster::new(dir.path().join("cluster"));

        for key in [
            ObjectKey::new("..", "Service", "client"),
            ObjectKey::new("shop", "Service", "../../escaped"),
            ObjectKey::new("shop", "", "client"),
        ] {
            let err = cluster.create(&key, &json!({})).await.unwrap_err();
            assert!(matches!(err, ClusterError::Rejected { .. }), "{key}");
        }
        assert!(!dir.path().join("escaped.json").exists());
    }

    #[tokio::test]
    async fn create_existing_and_patch_missing_fail() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FileCluster::new(dir.path());
        let key = ObjectKey::new("default", "ConfigMap", "a");

        let err = cluster.patch(&key, &json!({})).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));

        cluster.create(&key, &json!({})).await.unwrap();
        let err = cluster.create(&key, &json!({})).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }
}
