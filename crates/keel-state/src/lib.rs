//! keel-state — release history store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage of release revisions and their status logs.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Keys are
//! `{release}/{revision:020}` so a prefix range scan yields one release's
//! revisions in numeric order.
//!
//! A revision record is written once. Status changes (`pending`, `deployed`,
//! `failed`, `rolled-back`) are appended to a separate log, so a rollback
//! marks the revision it replaces without rewriting it.
//!
//! The `ReleaseStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks. A file-backed store only holds the redb file open for the
//! duration of one operation, so separate processes can share it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReleaseStore, epoch_secs, validate_name};
pub use types::*;
