//! Pipeline error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::trigger::Trigger;

/// Errors that stop a pipeline before any job runs.
///
/// Failures of individual jobs are reported in the
/// [`PipelineRun`](crate::PipelineRun), not here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline spec {path}: {message}")]
    InvalidSpec { path: PathBuf, message: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trigger {trigger} does not match branches [{}]", branches.join(", "))]
    NotTriggered {
        trigger: Trigger,
        branches: Vec<String>,
    },

    #[error("environment {0} has no registry configured")]
    NoRegistry(String),

    #[error(transparent)]
    Core(#[from] keel_core::CoreError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
