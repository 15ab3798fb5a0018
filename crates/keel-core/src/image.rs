//! Artifact references in the image registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// `registry/repository:tag`, e.g. `registry.example.com:5000/shop/client:3f2a9c1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> CoreResult<Self> {
        let image = Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        };
        image.validate()?;
        Ok(image)
    }

    pub fn parse(reference: &str) -> CoreResult<Self> {
        let reference = reference.strip_prefix("oci://").unwrap_or(reference);
        // A ':' after the last '/' separates the tag; earlier ones are ports.
        let (path, tag) = match reference.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => return Err(CoreError::InvalidImage(format!("{reference}: missing tag"))),
        };
        let (registry, repository) = path
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidImage(format!("{reference}: missing registry")))?;
        Self::new(registry, repository, tag)
    }

    /// `registry/repository` without the tag.
    pub fn repository_url(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.registry.is_empty() || self.repository.is_empty() {
            return Err(CoreError::InvalidImage(format!(
                "{self}: registry and repository are required"
            )));
        }
        let tag_ok = !self.tag.is_empty()
            && self.tag.len() <= 128
            && self
                .tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !tag_ok {
            return Err(CoreError::InvalidImage(format!("{self}: invalid tag")));
        }
        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}
