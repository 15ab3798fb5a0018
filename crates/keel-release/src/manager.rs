//! Release manager: upgrade, rollback and history for named releases.
//!
//! An upgrade resolves values, renders and orders the chart before anything
//! is recorded or applied, so render, validation and cycle errors never
//! leave a revision behind. Once ordered, the revision is appended as
//! `pending`, applied, and moved to `deployed` or `failed`.
//!
//! A rollback copies a previous revision's resources into a new revision
//! with cause `rolled-back-to:<n>`. On success the revision it replaces is
//! marked `rolled-back` in the same store transaction.
//!
//! Upgrades and rollbacks both diff against the current deployed
//! revision's resources, so fields it applied that the new revision no
//! longer renders are removed.

use std::path::PathBuf;
use std::sync::Arc;

use keel_core::{
    Chart, ReleaseContext, ValueTree, manifest_digest, order, render_release, resolve_for_chart,
};
use keel_state::{
    ChartRef, Release, ReleaseCause, ReleaseStatus, ReleaseStore, Revision, RevisionRecord,
    StatusEntry, Transition, epoch_secs, validate_name,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::engine::{ApplyConfig, ApplyEngine, ApplyReport};
use crate::error::{ReleaseError, ReleaseResult};
use crate::lock::ReleaseLocks;

pub struct ReleaseManager {
    store: ReleaseStore,
    engine: ApplyEngine,
    locks: ReleaseLocks,
}

impl ReleaseManager {
    pub fn new(store: ReleaseStore, cluster: Arc<dyn ClusterApi>, config: ApplyConfig) -> Self {
        Self {
            store,
            engine: ApplyEngine::new(cluster, config),
            locks: ReleaseLocks::new(),
        }
    }

    /// Also serialize writers across processes through lock files in `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.locks = ReleaseLocks::with_dir(dir);
        self
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Install or upgrade `name` from `chart` with `overrides` layered over
    /// the chart defaults, lowest precedence first.
    ///
    /// Returns the deployed revision. An apply failure is returned as
    /// [`ReleaseError::Apply`] after the revision is recorded as `failed`.
    pub async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        overrides: &[ValueTree],
        cancel: &watch::Receiver<bool>,
    ) -> ReleaseResult<Release> {
        validate_name(name)?;
        let values = resolve_for_chart(chart, overrides)?;
        let rendered = render_release(chart, &values, &ReleaseContext::new(name, namespace))?;
        let resources = order(&rendered)?;

        let _guard = self.locks.acquire(name).await?;
        let previous = self
            .store
            .get(name, None)?
            .map(|current| current.record.resources)
            .unwrap_or_default();
        let revision = self.store.next_revision(name)?;
        let record = RevisionRecord {
            name: name.to_string(),
            revision,
            namespace: namespace.to_string(),
            chart: ChartRef {
                name: chart.name().to_string(),
                version: chart.version().to_string(),
                app_version: chart.app_version().to_string(),
            },
            values,
            digest: manifest_digest(&resources),
            resources,
            cause: if revision == 1 {
                ReleaseCause::Install
            } else {
                ReleaseCause::Upgrade
            },
            created_at: epoch_secs(),
        };
        self.store.append(&record)?;
        info!(release = %name, revision, chart = %chart.name(), "revision pending");

        let report = self
            .engine
            .apply(&record.resources, &previous, namespace, cancel)
            .await;
        self.finish(&record, report, None)
    }

    /// Re-apply the resources of `target` as a new revision.
    pub async fn rollback(
        &self,
        name: &str,
        target: Revision,
        cancel: &watch::Receiver<bool>,
    ) -> ReleaseResult<Release> {
        validate_name(name)?;
        let _guard = self.locks.acquire(name).await?;

        let source = self
            .store
            .get(name, Some(target))?
            .ok_or_else(|| ReleaseError::RevisionNotFound {
                release: name.to_string(),
                revision: target,
            })?;
        let current = self.store.get(name, None)?;
        let replaced = current.as_ref().map(|r| r.revision());
        let previous = current
            .map(|r| r.record.resources)
            .unwrap_or_default();

        let revision = self.store.next_revision(name)?;
        let record = RevisionRecord {
            revision,
            cause: ReleaseCause::RolledBackTo { revision: target },
            created_at: epoch_secs(),
            ..source.record
        };
        self.store.append(&record)?;
        info!(release = %name, revision, target, "rollback pending");

        let report = self
            .engine
            .apply(&record.resources, &previous, &record.namespace, cancel)
            .await;
        self.finish(&record, report, replaced)
    }

    /// One revision, or the current one when `revision` is `None`.
    pub fn get(&self, name: &str, revision: Option<Revision>) -> ReleaseResult<Release> {
        match self.store.get(name, revision)? {
            Some(release) => Ok(release),
            None => Err(match revision {
                Some(revision) => ReleaseError::RevisionNotFound {
                    release: name.to_string(),
                    revision,
                },
                None => ReleaseError::NotFound(name.to_string()),
            }),
        }
    }

    /// Every revision of `name`, most recent first.
    pub fn history(&self, name: &str) -> ReleaseResult<Vec<Release>> {
        let history = self.store.history(name)?;
        if history.is_empty() {
            return Err(ReleaseError::NotFound(name.to_string()));
        }
        Ok(history)
    }

    /// Status transitions of one revision, oldest first.
    pub fn status_log(&self, name: &str, revision: Revision) -> ReleaseResult<Vec<StatusEntry>> {
        let log = self.store.status_log(name, revision)?;
        if log.is_empty() {
            return Err(ReleaseError::RevisionNotFound {
                release: name.to_string(),
                revision,
            });
        }
        Ok(log)
    }

    fn finish(
        &self,
        record: &RevisionRecord,
        report: ApplyReport,
        replaced: Option<Revision>,
    ) -> ReleaseResult<Release> {
        let ApplyReport { record: outcome, error } = report;
        let name = &record.name;

        if let Some(err) = error {
            self.store.transition(
                name,
                &[Transition::new(record.revision, ReleaseStatus::Failed)
                    .with_outcome(outcome.clone())
                    .with_note(err.to_string())],
            )?;
            warn!(
                release = %name,
                revision = record.revision,
                succeeded = outcome.succeeded.len(),
                error = %err,
                "revision failed"
            );
            return Err(ReleaseError::Apply {
                release: name.clone(),
                revision: record.revision,
                outcome,
                source: err,
            });
        }

        let mut transitions =
            vec![Transition::new(record.revision, ReleaseStatus::Deployed).with_outcome(outcome)];
        if let Some(prev) = replaced {
            transitions.push(
                Transition::new(prev, ReleaseStatus::RolledBack)
                    .with_note(format!("replaced by revision {}", record.revision)),
            );
        }
        self.store.transition(name, &transitions)?;
        info!(release = %name, revision = record.revision, cause = %record.cause, "revision deployed");
        self.get(name, Some(record.revision))
    }
}
