//! Scoped, per-job credentials.
//!
//! Each job asks for exactly the scopes it needs and drops the credentials
//! when it finishes. Build jobs get `registry-push`; the deploy job gets
//! `registry-pull` and `cluster-write`. Tokens are consumed here, never
//! minted.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    RegistryPush,
    RegistryPull,
    ClusterWrite,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::RegistryPush => "registry-push",
            Scope::RegistryPull => "registry-pull",
            Scope::ClusterWrite => "cluster-write",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("job {job}: no credential available for scope {scope}")]
    Missing { job: String, scope: Scope },

    #[error("job {job}: scope {scope} denied: {reason}")]
    Denied {
        job: String,
        scope: Scope,
        reason: String,
    },
}

/// Tokens for a fixed set of scopes. `Debug` never prints token values.
#[derive(Clone)]
pub struct ScopedCredentials {
    job: String,
    tokens: BTreeMap<Scope, String>,
}

impl ScopedCredentials {
    pub fn new(job: impl Into<String>, tokens: BTreeMap<Scope, String>) -> Self {
        Self {
            job: job.into(),
            tokens,
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn scopes(&self) -> Vec<Scope> {
        self.tokens.keys().copied().collect()
    }

    pub fn token(&self, scope: Scope) -> Option<&str> {
        self.tokens.get(&scope).map(String::as_str)
    }
}

impl fmt::Debug for ScopedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredentials")
            .field("job", &self.job)
            .field("scopes", &self.scopes())
            .field("tokens", &"<redacted>")
            .finish()
    }
}

/// Source of per-job credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `job` holding exactly `scopes`.
    async fn issue(
        &self,
        job: &str,
        scopes: &[Scope],
    ) -> Result<ScopedCredentials, CredentialError>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `KEEL_REGISTRY_TOKEN` (registry scopes) and `KEEL_CLUSTER_TOKEN`
/// (cluster scope).
pub struct EnvCredentialProvider {
    lookup: Lookup,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn variable(scope: Scope) -> &'static str {
        match scope {
            Scope::RegistryPush | Scope::RegistryPull => "KEEL_REGISTRY_TOKEN",
            Scope::ClusterWrite => "KEEL_CLUSTER_TOKEN",
        }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn issue(
        &self,
        job: &str,
        scopes: &[Scope],
    ) -> Result<ScopedCredentials, CredentialError> {
        let mut tokens = BTreeMap::new();
        for &scope in scopes {
            let token = (self.lookup)(Self::variable(scope))
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| CredentialError::Missing {
                    job: job.to_string(),
                    scope,
                })?;
            tokens.insert(scope, token);
        }
        Ok(ScopedCredentials::new(job, tokens))
    }
}

/// Fixed tokens per scope; scopes without a token are denied.
#[derive(Default)]
pub struct StaticCredentialProvider {
    tokens: BTreeMap<Scope, String>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: Scope, token: impl Into<String>) -> Self {
        self.tokens.insert(scope, token.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn issue(
        &self,
        job: &str,
        scopes: &[Scope],
    ) -> Result<ScopedCredentials, CredentialError> {
        let mut tokens = BTreeMap::new();
        for &scope in scopes {
            let token = self.tokens.get(&scope).ok_or_else(|| CredentialError::Denied {
                job: job.to_string(),
                scope,
                reason: "scope not granted".to_string(),
            })?;
            tokens.insert(scope, token.clone());
        }
        Ok(ScopedCredentials::new(job, tokens))
    }
}
