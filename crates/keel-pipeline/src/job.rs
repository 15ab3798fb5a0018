//! Jobs of one pipeline run and their status history.

use std::fmt;
use std::time::Instant;

use keel_core::ImageRef;
use keel_state::Revision;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobKind {
    Build { service: String },
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// Jobs that must succeed before this one may start.
    pub depends_on: Vec<String>,
    pub status: JobStatus,
    /// Published image, for build jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    /// Release revision written, for the deploy job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn build(service: &str) -> Self {
        let kind = JobKind::Build {
            service: service.to_string(),
        };
        Self::queued(format!("build-{service}"), kind, Vec::new())
    }

    pub fn deploy(depends_on: Vec<String>) -> Self {
        Self::queued("deploy".to_string(), JobKind::Deploy, depends_on)
    }

    fn queued(id: String, kind: JobKind, depends_on: Vec<String>) -> Self {
        Self {
            id,
            kind,
            depends_on,
            status: JobStatus::Queued,
            image: None,
            revision: None,
            error: None,
        }
    }
}

/// One status change of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job: String,
    pub status: JobStatus,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
}

/// The jobs of a run plus every status change in the order it happened.
#[derive(Debug)]
pub(crate) struct JobBoard {
    jobs: Vec<Job>,
    events: Vec<JobEvent>,
    started: Instant,
}

impl JobBoard {
    pub fn new(jobs: Vec<Job>) -> Self {
        let mut board = Self {
            jobs: Vec::new(),
            events: Vec::new(),
            started: Instant::now(),
        };
        for job in jobs {
            board.push_event(&job.id, JobStatus::Queued);
            board.jobs.push(job);
        }
        board
    }

    pub fn set(&mut self, index: usize, status: JobStatus) {
        if let Some(job) = self.jobs.get_mut(index) {
            job.status = status;
            let id = job.id.clone();
            self.push_event(&id, status);
        }
    }

    pub fn job_mut(&mut self, index: usize) -> Option<&mut Job> {
        self.jobs.get_mut(index)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    fn push_event(&mut self, job: &str, status: JobStatus) {
        self.events.push(JobEvent {
            job: job.to_string(),
            status,
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
    }

    pub fn into_parts(self) -> (Vec<Job>, Vec<JobEvent>) {
        (self.jobs, self.events)
    }
}
