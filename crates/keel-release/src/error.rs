//! Error types for applying and managing releases.

use std::time::Duration;

use keel_core::{CoreError, ResourceId};
use keel_state::{ApplyRecord, Revision, StateError};
use thiserror::Error;

use crate::cluster::ClusterError;

/// Result type alias for release operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Why the apply engine stopped on a resource.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{resource}: {source}")]
    Cluster {
        resource: ResourceId,
        #[source]
        source: ClusterError,
    },

    #[error("{resource}: cluster call timed out after {timeout:?}")]
    CallTimeout {
        resource: ResourceId,
        timeout: Duration,
    },

    #[error("{resource}: not ready after {timeout:?}")]
    ReadinessTimeout {
        resource: ResourceId,
        timeout: Duration,
    },

    #[error("cancelled before {next}")]
    Cancelled { next: ResourceId },
}

impl ApplyError {
    /// The resource the error is attributed to.
    pub fn resource(&self) -> &ResourceId {
        match self {
            ApplyError::Cluster { resource, .. }
            | ApplyError::CallTimeout { resource, .. }
            | ApplyError::ReadinessTimeout { resource, .. } => resource,
            ApplyError::Cancelled { next } => next,
        }
    }
}

/// Errors surfaced by [`ReleaseManager`](crate::ReleaseManager).
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Values, rendering, validation or ordering failed; nothing was applied.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    State(#[from] StateError),

    /// The apply stopped part-way. The revision is recorded as `failed`
    /// together with `outcome`.
    #[error("release {release} revision {revision} failed: {source}")]
    Apply {
        release: String,
        revision: Revision,
        outcome: ApplyRecord,
        #[source]
        source: ApplyError,
    },

    #[error("release {release}: cannot take the release lock: {source}")]
    Lock {
        release: String,
        #[source]
        source: std::io::Error,
    },

    #[error("release {0} not found")]
    NotFound(String),

    #[error("release {release} has no revision {revision}")]
    RevisionNotFound { release: String, revision: Revision },
}
