//! Artifact builders.
//!
//! A builder turns a service's source tree into an image in the registry.
//! The toolchain itself is external; [`CommandBuilder`] shells out to the
//! service's configured command.

use std::process::Stdio;

use async_trait::async_trait;
use keel_core::ImageRef;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::{Scope, ScopedCredentials};
use crate::spec::ServiceSpec;

/// Everything a build job hands to the builder.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub service: ServiceSpec,
    /// Where the artifact must be published.
    pub image: ImageRef,
    pub credentials: ScopedCredentials,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("service {0} has no build command")]
    NoCommand(String),

    #[error("service {service}: failed to start build: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {service}: build exited with {status}: {output}")]
    Failed {
        service: String,
        status: String,
        output: String,
    },
}

#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build and publish; returns the published image.
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, BuildError>;
}

/// Runs `service.command` inside `service.context`.
///
/// The command sees `KEEL_IMAGE`, `KEEL_IMAGE_REPOSITORY`,
/// `KEEL_IMAGE_TAG` and, when issued, `KEEL_REGISTRY_TOKEN`.
#[derive(Debug, Default)]
pub struct CommandBuilder;

/// Trailing bytes of output kept in error messages.
const OUTPUT_TAIL: usize = 2048;

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, BuildError> {
        let service = &request.service;
        let (program, args) = service
            .command
            .split_first()
            .ok_or_else(|| BuildError::NoCommand(service.name.clone()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&service.context)
            .env("KEEL_IMAGE", request.image.to_string())
            .env("KEEL_IMAGE_REPOSITORY", request.image.repository_url())
            .env("KEEL_IMAGE_TAG", &request.image.tag)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = request.credentials.token(Scope::RegistryPush) {
            command.env("KEEL_REGISTRY_TOKEN", token);
        }

        debug!(service = %service.name, image = %request.image, "running build command");
        let output = command.output().await.map_err(|source| BuildError::Spawn {
            service: service.name.clone(),
            source,
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(OUTPUT_TAIL);
            let tail = stderr
                .char_indices()
                .find(|(i, _)| *i >= start)
                .map(|(i, _)| &stderr[i..])
                .unwrap_or("");
            return Err(BuildError::Failed {
                service: service.name.clone(),
                status: output.status.to_string(),
                output: tail.trim().to_string(),
            });
        }
        Ok(request.image.clone())
    }
}
