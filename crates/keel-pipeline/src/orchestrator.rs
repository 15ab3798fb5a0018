//! Pipeline orchestrator: parallel builds gating one deploy.
//!
//! A run has one build job per service and a single deploy job that
//! depends on all of them. Builds run concurrently and never abort each
//! other. The gate is evaluated only once every build is terminal: any
//! failure (or a cancellation) skips the deploy, otherwise the deploy job
//! takes scoped credentials and upgrades the release with the freshly
//! built images layered over the environment values.

use std::sync::Arc;

use keel_core::{Chart, EnvironmentConfig, ImageRef, ValueTree};
use keel_release::{ApplyError, ReleaseError, ReleaseManager};
use keel_state::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builder::{ArtifactBuilder, BuildRequest};
use crate::credentials::{CredentialProvider, Scope};
use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobBoard, JobEvent, JobStatus};
use crate::spec::PipelineSpec;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunFailure {
    /// These builds failed; the deploy was skipped.
    Build { services: Vec<String> },
    /// The deploy job could not obtain its credentials. Nothing was applied.
    Credential { message: String },
    /// Values, rendering, validation or ordering failed. Nothing was applied.
    Render { message: String, cycle: bool },
    /// The apply stopped part-way; `revision` is recorded as failed.
    Apply { revision: Revision, message: String },
    /// The release store or another release-level error.
    Release { message: String },
    Cancelled,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub jobs: Vec<Job>,
    /// Every job status change, in order.
    pub events: Vec<JobEvent>,
    /// Release revision written by the deploy job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl PipelineRun {
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

pub struct Orchestrator {
    spec: PipelineSpec,
    chart: Chart,
    environment: EnvironmentConfig,
    builder: Arc<dyn ArtifactBuilder>,
    credentials: Arc<dyn CredentialProvider>,
    releases: Arc<ReleaseManager>,
}

impl Orchestrator {
    pub fn new(
        spec: PipelineSpec,
        chart: Chart,
        environment: EnvironmentConfig,
        builder: Arc<dyn ArtifactBuilder>,
        credentials: Arc<dyn CredentialProvider>,
        releases: Arc<ReleaseManager>,
    ) -> Self {
        Self {
            spec,
            chart,
            environment,
            builder,
            credentials,
            releases,
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub async fn run(&self, trigger: Trigger) -> PipelineResult<PipelineRun> {
        let (_cancel_tx, cancel) = watch::channel(false);
        self.run_with_cancel(trigger, cancel).await
    }

    /// Run the pipeline once. Errors are returned only for runs that never
    /// start; job failures are reported in the [`PipelineRun`].
    pub async fn run_with_cancel(
        &self,
        trigger: Trigger,
        cancel: watch::Receiver<bool>,
    ) -> PipelineResult<PipelineRun> {
        if !trigger.qualifies(&self.spec.branches) {
            return Err(PipelineError::NotTriggered {
                trigger,
                branches: self.spec.branches.clone(),
            });
        }
        let registry = self
            .environment
            .registry
            .clone()
            .ok_or_else(|| PipelineError::NoRegistry(self.environment.name.clone()))?;

        let run_id = Uuid::new_v4().to_string();
        let tag = trigger.image_tag(&run_id);
        let images = self
            .spec
            .services
            .iter()
            .map(|service| {
                ImageRef::new(registry.as_str(), service.repository.as_str(), tag.as_str())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs: Vec<Job> = self.spec.services.iter().map(|s| Job::build(&s.name)).collect();
        let build_ids = jobs.iter().map(|j| j.id.clone()).collect();
        jobs.push(Job::deploy(build_ids));
        let deploy = jobs.len() - 1;
        let mut board = JobBoard::new(jobs);

        info!(pipeline = %self.spec.name, run = %run_id, %trigger, tag = %tag, "pipeline run started");

        self.run_builds(&mut board, images, &cancel).await;

        // Gate: every build is terminal at this point.
        let failed: Vec<String> = self
            .spec
            .services
            .iter()
            .zip(board.jobs())
            .filter(|(_, job)| job.status != JobStatus::Succeeded)
            .map(|(service, _)| service.name.clone())
            .collect();
        let cancelled = *cancel.borrow();

        let (failure, revision) = if cancelled {
            board.set(deploy, JobStatus::Skipped);
            (Some(RunFailure::Cancelled), None)
        } else if !failed.is_empty() {
            warn!(pipeline = %self.spec.name, run = %run_id, ?failed, "builds failed, deploy skipped");
            board.set(deploy, JobStatus::Skipped);
            (Some(RunFailure::Build { services: failed }), None)
        } else {
            self.deploy(&mut board, deploy, &cancel).await
        };

        let status = match &failure {
            None => RunStatus::Succeeded,
            Some(RunFailure::Cancelled) => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        info!(pipeline = %self.spec.name, run = %run_id, ?status, ?revision, "pipeline run finished");

        let (jobs, events) = board.into_parts();
        Ok(PipelineRun {
            id: run_id,
            pipeline: self.spec.name.clone(),
            trigger,
            status,
            jobs,
            events,
            revision,
            failure,
        })
    }

    async fn run_builds(
        &self,
        board: &mut JobBoard,
        images: Vec<ImageRef>,
        cancel: &watch::Receiver<bool>,
    ) {
        let mut set = JoinSet::new();

        for (index, (service, image)) in self.spec.services.iter().zip(images).enumerate() {
            let cancelled = *cancel.borrow();
            if cancelled {
                board.set(index, JobStatus::Skipped);
                continue;
            }
            board.set(index, JobStatus::Running);

            let job_id = board.jobs()[index].id.clone();
            let builder = self.builder.clone();
            let credentials = self.credentials.clone();
            let service = service.clone();
            set.spawn(async move {
                let result = async {
                    let credentials = credentials
                        .issue(&job_id, &[Scope::RegistryPush])
                        .await
                        .map_err(|e| e.to_string())?;
                    let request = BuildRequest {
                        service,
                        image,
                        credentials,
                    };
                    builder.build(&request).await.map_err(|e| e.to_string())
                }
                .await;
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "build task aborted");
                    continue;
                }
            };
            let status = match result {
                Ok(image) => {
                    info!(job = %board.jobs()[index].id, image = %image, "build succeeded");
                    if let Some(job) = board.job_mut(index) {
                        job.image = Some(image);
                    }
                    JobStatus::Succeeded
                }
                Err(message) => {
                    warn!(job = %board.jobs()[index].id, error = %message, "build failed");
                    if let Some(job) = board.job_mut(index) {
                        job.error = Some(message);
                    }
                    JobStatus::Failed
                }
            };
            board.set(index, status);
        }

        // A task that panicked never reported back.
        for index in 0..self.spec.services.len() {
            if board.jobs()[index].status == JobStatus::Running {
                if let Some(job) = board.job_mut(index) {
                    job.error = Some("build task panicked".to_string());
                }
                board.set(index, JobStatus::Failed);
            }
        }
    }

    async fn deploy(
        &self,
        board: &mut JobBoard,
        deploy: usize,
        cancel: &watch::Receiver<bool>,
    ) -> (Option<RunFailure>, Option<Revision>) {
        board.set(deploy, JobStatus::Running);

        let credentials = match self
            .credentials
            .issue("deploy", &[Scope::RegistryPull, Scope::ClusterWrite])
            .await
        {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %err, "deploy credentials unavailable");
                let failure = RunFailure::Credential {
                    message: err.to_string(),
                };
                return fail(board, deploy, failure, None);
            }
        };
        debug!(scopes = ?credentials.scopes(), "deploy credentials issued");

        let overrides = match self.overrides(board.jobs()) {
            Ok(overrides) => overrides,
            Err(err) => {
                let failure = RunFailure::Render {
                    message: err.to_string(),
                    cycle: false,
                };
                return fail(board, deploy, failure, None);
            }
        };

        let result = self
            .releases
            .upgrade(&self.spec.release, &self.spec.namespace, &self.chart, &overrides, cancel)
            .await;
        drop(credentials);

        match result {
            Ok(release) => {
                let revision = release.revision();
                if let Some(job) = board.job_mut(deploy) {
                    job.revision = Some(revision);
                }
                board.set(deploy, JobStatus::Succeeded);
                info!(release = %self.spec.release, revision, "deploy succeeded");
                (None, Some(revision))
            }
            Err(err) => {
                warn!(release = %self.spec.release, error = %err, "deploy failed");
                let message = err.to_string();
                match err {
                    ReleaseError::Core(core) => {
                        let failure = RunFailure::Render {
                            message,
                            cycle: core.is_cycle(),
                        };
                        fail(board, deploy, failure, None)
                    }
                    ReleaseError::Apply { revision, source, .. } => {
                        let failure = match source {
                            ApplyError::Cancelled { .. } => RunFailure::Cancelled,
                            _ => RunFailure::Apply { revision, message },
                        };
                        fail(board, deploy, failure, Some(revision))
                    }
                    _ => fail(board, deploy, RunFailure::Release { message }, None),
                }
            }
        }
    }

    /// Environment values, then one `<values_key>.image` override per build.
    fn overrides(&self, jobs: &[Job]) -> PipelineResult<Vec<ValueTree>> {
        let mut images = ValueTree::new();
        for (service, job) in self.spec.services.iter().zip(jobs) {
            let Some(image) = &job.image else { continue };
            let mut leaf = Map::new();
            leaf.insert("repository".to_string(), Value::String(image.repository_url()));
            leaf.insert("tag".to_string(), Value::String(image.tag.clone()));
            let path = format!("{}.image", service.values_key());
            let tree = ValueTree::from_value("pipeline images", nest(&path, Value::Object(leaf)))?;
            images.merge(&tree);
        }
        Ok(vec![self.environment.to_values()?, images])
    }
}

fn fail(
    board: &mut JobBoard,
    deploy: usize,
    failure: RunFailure,
    revision: Option<Revision>,
) -> (Option<RunFailure>, Option<Revision>) {
    if let Some(job) = board.job_mut(deploy) {
        job.revision = revision;
        job.error = Some(match &failure {
            RunFailure::Credential { message }
            | RunFailure::Render { message, .. }
            | RunFailure::Apply { message, .. }
            | RunFailure::Release { message } => message.clone(),
            RunFailure::Build { .. } => "builds failed".to_string(),
            RunFailure::Cancelled => "cancelled".to_string(),
        });
    }
    board.set(deploy, JobStatus::Failed);
    (Some(failure), revision)
}

/// `a.b` + leaf → `{ "a": { "b": leaf } }`.
fn nest(path: &str, leaf: Value) -> Value {
    path.rsplit('.').fold(leaf, |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.to_string(), inner);
        Value::Object(map)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nest_builds_mapping_path() {
        assert_eq!(
            nest("services.client.image", json!({ "tag": "abc" })),
            json!({ "services": { "client": { "image": { "tag": "abc" } } } })
        );
    }
}
