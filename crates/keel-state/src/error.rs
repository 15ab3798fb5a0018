//! Error types for the Keel release store.

use thiserror::Error;

/// Result type alias for release store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during release store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid release name `{0}`: use lowercase letters, digits and '-', at most 53 characters")]
    InvalidName(String),

    #[error("release {name}: revision {revision} is not above the latest revision {latest}")]
    RevisionConflict {
        name: String,
        revision: u64,
        latest: u64,
    },

    #[error("release {name} revision {revision}: cannot go from {from} to {to}")]
    InvalidTransition {
        name: String,
        revision: u64,
        from: String,
        to: String,
    },
}
