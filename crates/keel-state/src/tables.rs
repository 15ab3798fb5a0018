//! redb table definitions for the release store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Revisions are zero-padded so lexical key order is numeric order.

use redb::TableDefinition;

/// Immutable revision records keyed by `{release}/{revision:020}`.
pub const REVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("revisions");

/// Append-only status transitions keyed by `{release}/{revision:020}/{seq:06}`.
pub const STATUS_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("status_log");

pub fn revision_key(name: &str, revision: u64) -> String {
    format!("{name}/{revision:020}")
}

pub fn status_key(name: &str, revision: u64, seq: u32) -> String {
    format!("{name}/{revision:020}/{seq:06}")
}

/// Half-open key range covering every key that starts with `prefix/`.
///
/// `'0'` is the character right after `'/'`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (format!("{prefix}/"), format!("{prefix}0"))
}
