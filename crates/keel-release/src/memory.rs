//! In-memory cluster backend for tests and dry runs.
//!
//! Behaves like a real API server in the ways the apply engine cares
//! about: objects gain runtime-owned fields on create (`metadata.uid`,
//! `metadata.resourceVersion`, `status`), patches are merge patches, and
//! readiness can be delayed or withheld per object.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::diff::apply_merge_patch;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    /// `(kind, name)` → rejection reason for create and patch.
    failures: HashMap<(String, String), String>,
    /// `(kind, name)` that never report ready.
    never_ready: HashSet<(String, String)>,
    /// `(kind, name)` → readiness checks left before reporting ready.
    ready_after: HashMap<(String, String), u32>,
    created: Vec<ObjectKey>,
    patched: Vec<(ObjectKey, Value)>,
    next_uid: u64,
}

/// Cluster held entirely in memory.
#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject every create or patch of `kind/name` with `reason`.
    pub fn fail_on(&self, kind: &str, name: &str, reason: &str) {
        self.state()
            .failures
            .insert((kind.to_string(), name.to_string()), reason.to_string());
    }

    /// `kind/name` never reports ready.
    pub fn never_ready(&self, kind: &str, name: &str) {
        self.state()
            .never_ready
            .insert((kind.to_string(), name.to_string()));
    }

    /// `kind/name` reports not-ready for the next `checks` readiness checks.
    pub fn ready_after(&self, kind: &str, name: &str, checks: u32) {
        self.state()
            .ready_after
            .insert((kind.to_string(), name.to_string()), checks);
    }

    /// Current stored object.
    pub fn object(&self, key: &ObjectKey) -> Option<Value> {
        self.state().objects.get(key).cloned()
    }

    /// Keys of every stored object, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.state().objects.keys().cloned().collect()
    }

    /// Objects created so far, in call order.
    pub fn created(&self) -> Vec<ObjectKey> {
        self.state().created.clone()
    }

    /// Patches sent so far, in call order.
    pub fn patches(&self) -> Vec<(ObjectKey, Value)> {
        self.state().patched.clone()
    }
}

impl Inner {
    fn check_failure(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        match self.failures.get(&(key.kind.clone(), key.name.clone())) {
            Some(reason) => Err(ClusterError::Rejected {
                key: key.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError> {
        Ok(self.object(key))
    }

    async fn create(&self, key: &ObjectKey, body: &Value) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.check_failure(key)?;
        if state.objects.contains_key(key) {
            return Err(ClusterError::AlreadyExists(key.clone()));
        }

        state.next_uid += 1;
        let mut object = body.clone();
        apply_merge_patch(
            &mut object,
            &json!({
                "metadata": {
                    "uid": format!("uid-{:04}", state.next_uid),
                    "resourceVersion": "1"
                },
                "status": { "observedGeneration": 1 }
            }),
        );
        state.objects.insert(key.clone(), object);
        state.created.push(key.clone());
        Ok(())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.check_failure(key)?;
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

        apply_merge_patch(object, patch);
        let version = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        apply_merge_patch(
            object,
            &json!({ "metadata": { "resourceVersion": (version + 1).to_string() } }),
        );
        state.patched.push((key.clone(), patch.clone()));
        Ok(())
    }

    async fn is_ready(&self, key: &ObjectKey) -> Result<bool, ClusterError> {
        let mut state = self.state();
        if !state.objects.contains_key(key) {
            return Err(ClusterError::NotFound(key.clone()));
        }
        let id = (key.kind.clone(), key.name.clone());
        if state.never_ready.contains(&id) {
            return Ok(false);
        }
        match state.ready_after.get_mut(&id) {
            Some(0) | None => Ok(true),
            Some(left) => {
                *left -= 1;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", "ConfigMap", name)
    }

    #[tokio::test]
    async fn create_adds_runtime_fields() {
        let cluster = MemoryCluster::new();
        cluster
            .create(&key("a"), &json!({ "metadata": { "name": "a" }, "data": { "k": "v" } }))
            .await
            .unwrap();

        let object = cluster.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(object["data"]["k"], "v");
        assert_eq!(object["metadata"]["resourceVersion"], "1");
        assert!(object["metadata"]["uid"].is_string());
        assert!(cluster.is_ready(&key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let cluster = MemoryCluster::new();
        cluster.create(&key("a"), &json!({})).await.unwrap();
        let err = cluster.create(&key("a"), &json!({})).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn patch_bumps_resource_version() {
        let cluster = MemoryCluster::new();
        cluster.create(&key("a"), &json!({ "data": { "k": "v" } })).await.unwrap();
        cluster
            .patch(&key("a"), &json!({ "data": { "k": "w" } }))
            .await
            .unwrap();

        let object = cluster.object(&key("a")).unwrap();
        assert_eq!(object["data"]["k"], "w");
        assert_eq!(object["metadata"]["resourceVersion"], "2");
        assert_eq!(object["status"]["observedGeneration"], 1);
        assert_eq!(cluster.patches().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_and_readiness() {
        let cluster = MemoryCluster::new();
        cluster.fail_on("ConfigMap", "a", "quota exceeded");
        let err = cluster.create(&key("a"), &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        cluster.ready_after("ConfigMap", "b", 2);
        cluster.create(&key("b"), &json!({})).await.unwrap();
        assert!(!cluster.is_ready(&key("b")).await.unwrap());
        assert!(!cluster.is_ready(&key("b")).await.unwrap());
        assert!(cluster.is_ready(&key("b")).await.unwrap());
    }

    #[tokio::test]
    async fn patch_of_missing_object_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = cluster.patch(&key("a"), &json!({})).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
