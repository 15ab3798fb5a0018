//! Apply engine: reconciles ordered resources against a cluster.
//!
//! Resources are applied strictly one after another. For each one the
//! engine reads the live object, creates it when absent or merge-patches
//! only the differing fields when present, then waits (bounded) for it to
//! become ready before moving on. Fields the previous revision applied
//! that are no longer rendered are removed in the same patch. The first
//! failure stops the run; earlier resources are left in place and the
//! returned [`ApplyRecord`] says exactly which ones succeeded.
//!
//! Cancellation is checked between resources, never during a call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{RenderedResource, ResourceId};
use keel_state::{AppliedResource, ApplyRecord, FailedResource, ResourceAction};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::diff::diff;
use crate::error::ApplyError;

/// Timeouts for one apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Bound on each get/create/patch/readiness call.
    pub call_timeout: Duration,
    /// Bound on waiting for one resource to become ready.
    pub readiness_timeout: Duration,
    /// Delay between readiness checks.
    pub poll_interval: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Result of one apply run.
#[derive(Debug)]
pub struct ApplyReport {
    pub record: ApplyRecord,
    /// Set when the run stopped before the last resource.
    pub error: Option<ApplyError>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ApplyEngine {
    cluster: Arc<dyn ClusterApi>,
    config: ApplyConfig,
}

impl ApplyEngine {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ApplyConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    /// Apply `resources` in the given order into `namespace`.
    ///
    /// `previous` is the resource set last applied for this release, used
    /// to find fields that must be removed. Pass `&[]` on first install.
    pub async fn apply(
        &self,
        resources: &[RenderedResource],
        previous: &[RenderedResource],
        namespace: &str,
        cancel: &watch::Receiver<bool>,
    ) -> ApplyReport {
        let mut record = ApplyRecord::default();

        for (index, resource) in resources.iter().enumerate() {
            let remaining = || resources[index..].iter().map(|r| r.id.clone()).collect::<Vec<_>>();

            let cancelled = *cancel.borrow();
            if cancelled {
                warn!(next = %resource.id, applied = index, "apply cancelled");
                record.cancelled = true;
                record.not_attempted = remaining();
                return ApplyReport {
                    record,
                    error: Some(ApplyError::Cancelled {
                        next: resource.id.clone(),
                    }),
                };
            }

            let last_applied = previous
                .iter()
                .find(|p| p.id == resource.id)
                .map(|p| &p.body);
            match self.apply_one(resource, last_applied, namespace).await {
                Ok(action) => {
                    debug!(resource = %resource.id, ?action, "resource applied");
                    record.succeeded.push(AppliedResource {
                        id: resource.id.clone(),
                        action,
                    });
                }
                Err(err) => {
                    warn!(resource = %resource.id, error = %err, "resource apply failed");
                    record.failed = Some(FailedResource {
                        id: resource.id.clone(),
                        error: err.to_string(),
                    });
                    record.not_attempted =
                        resources[index + 1..].iter().map(|r| r.id.clone()).collect();
                    return ApplyReport {
                        record,
                        error: Some(err),
                    };
                }
            }
        }

        info!(
            resources = resources.len(),
            mutated = record.mutation_count(),
            "apply complete"
        );
        ApplyReport {
            record,
            error: None,
        }
    }

    async fn apply_one(
        &self,
        resource: &RenderedResource,
        last_applied: Option<&Value>,
        namespace: &str,
    ) -> Result<ResourceAction, ApplyError> {
        let key = ObjectKey::for_resource(resource, namespace);
        let live = self.call(&resource.id, self.cluster.get(&key)).await?;

        let action = match live {
            None => {
                self.call(&resource.id, self.cluster.create(&key, &resource.body))
                    .await?;
                ResourceAction::Created
            }
            Some(live) => match diff(&resource.body, &live, last_applied) {
                None => ResourceAction::Unchanged,
                Some(d) => {
                    self.call(&resource.id, self.cluster.patch(&key, &d.patch))
                        .await?;
                    ResourceAction::Patched { fields: d.fields }
                }
            },
        };

        self.await_ready(&resource.id, &key).await?;
        Ok(action)
    }

    async fn call<T>(
        &self,
        resource: &ResourceId,
        fut: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ApplyError> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ApplyError::Cluster {
                resource: resource.clone(),
                source,
            }),
            Err(_) => Err(ApplyError::CallTimeout {
                resource: resource.clone(),
                timeout: self.config.call_timeout,
            }),
        }
    }

    async fn await_ready(&self, resource: &ResourceId, key: &ObjectKey) -> Result<(), ApplyError> {
        let poll = async {
            loop {
                if self.call(resource, self.cluster.is_ready(key)).await? {
                    return Ok(());
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.config.readiness_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ApplyError::ReadinessTimeout {
                resource: resource.clone(),
                timeout: self.config.readiness_timeout,
            }),
        }
    }
}
