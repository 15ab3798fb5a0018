//! Domain types for the release store.
//!
//! A revision is written once as a [`RevisionRecord`] and never rewritten.
//! Its lifecycle is an append-only list of [`StatusEntry`] values; the
//! [`Release`] view pairs the record with its latest status.

use std::fmt;

use serde::{Deserialize, Serialize};

use keel_core::{RenderedResource, ResourceId, ValueTree};

/// Revision number within one named release. Starts at 1.
pub type Revision = u64;

/// Lifecycle status of one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Pending,
    Deployed,
    Failed,
    RolledBack,
}

impl ReleaseStatus {
    /// Allowed moves: `pending → deployed | failed`, `deployed → rolled-back`.
    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        matches!(
            (self, next),
            (ReleaseStatus::Pending, ReleaseStatus::Deployed)
                | (ReleaseStatus::Pending, ReleaseStatus::Failed)
                | (ReleaseStatus::Deployed, ReleaseStatus::RolledBack)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::RolledBack => "rolled-back",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a revision was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReleaseCause {
    Install,
    Upgrade,
    RolledBackTo { revision: Revision },
}

impl fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseCause::Install => f.write_str("install"),
            ReleaseCause::Upgrade => f.write_str("upgrade"),
            ReleaseCause::RolledBackTo { revision } => write!(f, "rolled-back-to:{revision}"),
        }
    }
}

/// Chart identity captured with each revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub name: String,
    pub version: String,
    pub app_version: String,
}

/// Immutable snapshot of what a revision deploys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub name: String,
    pub revision: Revision,
    pub namespace: String,
    pub chart: ChartRef,
    /// Resolved values the resources were rendered from.
    pub values: ValueTree,
    /// Resources in apply order.
    pub resources: Vec<RenderedResource>,
    /// SHA-256 of the resource set.
    pub digest: String,
    pub cause: ReleaseCause,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl RevisionRecord {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef {
            name: self.name.clone(),
            revision: self.revision,
        }
    }
}

/// Handle to a stored revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub name: String,
    pub revision: Revision,
}

/// What the apply engine did to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ResourceAction {
    Created,
    /// Only the listed field paths were sent.
    Patched { fields: Vec<String> },
    Unchanged,
}

impl ResourceAction {
    /// True when the cluster was written to.
    pub fn mutated(&self) -> bool {
        !matches!(self, ResourceAction::Unchanged)
    }
}

/// A resource that was applied successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedResource {
    pub id: ResourceId,
    #[serde(flatten)]
    pub action: ResourceAction,
}

/// The resource whose apply failed, with the error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedResource {
    pub id: ResourceId,
    pub error: String,
}

/// Attribution of an apply run: exactly which resources succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRecord {
    pub succeeded: Vec<AppliedResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<FailedResource>,
    #[serde(default)]
    pub not_attempted: Vec<ResourceId>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ApplyRecord {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.not_attempted.is_empty() && !self.cancelled
    }

    pub fn succeeded_ids(&self) -> Vec<&ResourceId> {
        self.succeeded.iter().map(|a| &a.id).collect()
    }

    /// Number of resources the cluster was written to.
    pub fn mutation_count(&self) -> usize {
        self.succeeded.iter().filter(|a| a.action.mutated()).count()
    }
}

/// One entry of a revision's status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: ReleaseStatus,
    /// Unix timestamp (seconds).
    pub at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApplyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A status change to append for one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub revision: Revision,
    pub status: ReleaseStatus,
    pub outcome: Option<ApplyRecord>,
    pub note: Option<String>,
}

impl Transition {
    pub fn new(revision: Revision, status: ReleaseStatus) -> Self {
        Self {
            revision,
            status,
            outcome: None,
            note: None,
        }
    }

    pub fn with_outcome(mut self, outcome: ApplyRecord) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A revision record together with its current status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    #[serde(flatten)]
    pub record: RevisionRecord,
    pub status: ReleaseStatus,
    /// Apply attribution from the most recent entry that carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApplyRecord>,
    pub updated_at: u64,
}

impl Release {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn revision(&self) -> Revision {
        self.record.revision
    }

    pub(crate) fn from_log(record: RevisionRecord, log: &[StatusEntry]) -> Self {
        let last = log.last();
        Self {
            status: last.map(|e| e.status).unwrap_or(ReleaseStatus::Pending),
            outcome: log.iter().rev().find_map(|e| e.outcome.clone()),
            updated_at: last.map(|e| e.at).unwrap_or(record.created_at),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine() {
        use ReleaseStatus::*;
        assert!(Pending.can_transition_to(Deployed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Deployed.can_transition_to(RolledBack));
        assert!(!Failed.can_transition_to(Deployed));
        assert!(!Deployed.can_transition_to(Failed));
        assert!(!RolledBack.can_transition_to(Deployed));
        assert!(!Pending.can_transition_to(RolledBack));
    }

    #[test]
    fn cause_display_matches_rollback_marker() {
        assert_eq!(ReleaseCause::RolledBackTo { revision: 2 }.to_string(), "rolled-back-to:2");
        assert_eq!(ReleaseCause::Upgrade.to_string(), "upgrade");
    }

    #[test]
    fn apply_record_counts_mutations() {
        let record = ApplyRecord {
            succeeded: vec![
                AppliedResource {
                    id: ResourceId::new("ConfigMap", "a"),
                    action: ResourceAction::Unchanged,
                },
                AppliedResource {
                    id: ResourceId::new("Deployment", "b"),
                    action: ResourceAction::Patched {
                        fields: vec!["spec.replicas".to_string()],
                    },
                },
            ],
            ..Default::default()
        };
        assert_eq!(record.mutation_count(), 1);
        assert!(record.is_complete());
    }
}
