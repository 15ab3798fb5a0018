//! keel-pipeline — build/deploy pipeline orchestration.
//!
//! One build job per service runs concurrently; a single deploy job waits
//! for all of them and upgrades the release only when every build
//! succeeded. Each job holds credentials for exactly the scopes it needs.
//!
//! # Components
//!
//! - **`spec`**: `keel-pipeline.toml` definition
//! - **`trigger`**: manual and branch-event triggers
//! - **`job`**: job model and status history
//! - **`credentials`**: scoped per-job credentials
//! - **`builder`**: artifact builders
//! - **`orchestrator`**: the run loop and deploy gate

pub mod builder;
pub mod credentials;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod spec;
pub mod trigger;

pub use builder::{ArtifactBuilder, BuildError, BuildRequest, CommandBuilder};
pub use credentials::{
    CredentialError, CredentialProvider, EnvCredentialProvider, Scope, ScopedCredentials,
    StaticCredentialProvider,
};
pub use error::{PipelineError, PipelineResult};
pub use job::{Job, JobEvent, JobKind, JobStatus};
pub use orchestrator::{Orchestrator, PipelineRun, RunFailure, RunStatus};
pub use spec::{PipelineSpec, ServiceSpec};
pub use trigger::Trigger;
