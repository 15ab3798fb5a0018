//! What starts a pipeline run.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    /// Started by hand. Always qualifies.
    Manual { actor: String },
    /// A push to `ref_name` (`refs/heads/main` or `main`) at `commit`.
    Event { ref_name: String, commit: String },
}

impl Trigger {
    /// Whether this trigger starts a run for a pipeline watching `branches`.
    pub fn qualifies(&self, branches: &[String]) -> bool {
        match self {
            Trigger::Manual { .. } => true,
            Trigger::Event { ref_name, .. } => {
                branches.is_empty() || branches.iter().any(|b| b == branch_of(ref_name))
            }
        }
    }

    pub fn commit(&self) -> Option<&str> {
        match self {
            Trigger::Manual { .. } => None,
            Trigger::Event { commit, .. } => Some(commit),
        }
    }

    /// Image tag for this run: the short commit for events, otherwise
    /// derived from the run id.
    pub fn image_tag(&self, run_id: &str) -> String {
        let short = |s: &str| {
            s.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(8)
                .collect::<String>()
        };
        match self.commit().map(short) {
            Some(commit) if !commit.is_empty() => commit.to_ascii_lowercase(),
            _ => format!("run-{}", short(run_id)),
        }
    }
}

fn branch_of(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual { actor } => write!(f, "manual by {actor}"),
            Trigger::Event { ref_name, commit } => write!(f, "push to {ref_name} at {commit}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(ref_name: &str) -> Trigger {
        Trigger::Event {
            ref_name: ref_name.to_string(),
            commit: "3F2A9C1D0E".to_string(),
        }
    }

    #[test]
    fn events_match_configured_branches() {
        let branches = vec!["main".to_string(), "release".to_string()];
        assert!(push("refs/heads/main").qualifies(&branches));
        assert!(push("release").qualifies(&branches));
        assert!(!push("refs/heads/feature/x").qualifies(&branches));
        assert!(push("refs/heads/feature/x").qualifies(&[]));
    }

    #[test]
    fn manual_always_qualifies() {
        let manual = Trigger::Manual {
            actor: "ops".to_string(),
        };
        assert!(manual.qualifies(&["main".to_string()]));
    }

    #[test]
    fn tags_come_from_commit_or_run() {
        assert_eq!(push("main").image_tag("ignored"), "3f2a9c1d");
        let manual = Trigger::Manual {
            actor: "ops".to_string(),
        };
        assert_eq!(
            manual.image_tag("5c1e0b2a-1111-2222-3333-444455556666"),
            "run-5c1e0b2a"
        );
    }
}
