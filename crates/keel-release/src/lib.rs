//! keel-release — applying and tracking releases.
//!
//! Takes a chart plus values to a running, versioned set of resources in a
//! target cluster, with every revision recorded for history and rollback.
//!
//! # Components
//!
//! - **`cluster`**: target cluster API trait and object keys
//! - **`memory`** / **`file`**: in-memory and directory-backed clusters
//! - **`diff`**: structural diff and JSON merge patch
//! - **`engine`**: ordered create-or-patch with bounded readiness waits
//! - **`lock`**: per-release writer locks
//! - **`manager`**: upgrade, rollback, history

pub mod cluster;
pub mod diff;
pub mod engine;
pub mod error;
pub mod file;
pub mod lock;
pub mod manager;
pub mod memory;

pub use cluster::{ClusterApi, ClusterError, ObjectKey};
pub use engine::{ApplyConfig, ApplyEngine, ApplyReport};
pub use error::{ApplyError, ReleaseError, ReleaseResult};
pub use file::FileCluster;
pub use lock::{ReleaseGuard, ReleaseLocks};
pub use manager::ReleaseManager;
pub use memory::MemoryCluster;
