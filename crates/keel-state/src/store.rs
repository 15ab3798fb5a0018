//! ReleaseStore: redb-backed revision history.
//!
//! Revision records are inserted once and never overwritten. Status changes
//! are appended to a separate log so the state machine can progress without
//! touching the record. Every mutation validates its precondition inside the
//! same write transaction, and redb allows one writer at a time, so the
//! checks cannot race.
//!
//! A file-backed store opens the database for each operation and closes it
//! afterwards. redb holds an exclusive lock on the file while it is open, so
//! several processes can share one store as long as none keeps it open. An
//! open that finds the file locked is retried with bounded backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const OPEN_ATTEMPTS: u32 = 60;
const OPEN_BACKOFF_START: Duration = Duration::from_millis(10);
const OPEN_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Clone)]
enum Backend {
    File(PathBuf),
    Memory(Arc<Database>),
}

/// Thread-safe release store backed by redb.
#[derive(Clone)]
pub struct ReleaseStore {
    backend: Backend,
}

impl ReleaseStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// The file is not held open between operations.
    pub fn open(path: &Path) -> StateResult<Self> {
        let store = Self {
            backend: Backend::File(path.to_path_buf()),
        };
        store.ensure_tables()?;
        debug!(?path, "release store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            backend: Backend::Memory(Arc::new(db)),
        };
        store.ensure_tables()?;
        debug!("in-memory release store opened");
        Ok(store)
    }

    /// The database for one operation. A file-backed handle closes on drop.
    fn db(&self) -> StateResult<Arc<Database>> {
        match &self.backend {
            Backend::Memory(db) => Ok(Arc::clone(db)),
            Backend::File(path) => open_file(path).map(Arc::new),
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Append a new revision in `pending` state.
    ///
    /// The revision number must be above every existing revision of the
    /// release; numbers are never reused.
    pub fn append(&self, record: &RevisionRecord) -> StateResult<RecordRef> {
        validate_name(&record.name)?;
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let pending = StatusEntry {
            status: ReleaseStatus::Pending,
            at: record.created_at,
            outcome: None,
            note: Some(record.cause.to_string()),
        };
        let entry = serde_json::to_vec(&pending).map_err(map_err!(Serialize))?;

        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut revisions = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
            let latest = latest_revision_in(&revisions, &record.name)?;
            if record.revision <= latest {
                return Err(StateError::RevisionConflict {
                    name: record.name.clone(),
                    revision: record.revision,
                    latest,
                });
            }
            let key = revision_key(&record.name, record.revision);
            revisions
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut log = txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;
            let key = status_key(&record.name, record.revision, 0);
            log.insert(key.as_str(), entry.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(release = %record.name, revision = record.revision, "revision appended");
        Ok(record.record_ref())
    }

    /// Append status transitions for revisions of one release, atomically.
    ///
    /// Each transition must be allowed from the revision's current status.
    pub fn transition(&self, name: &str, transitions: &[Transition]) -> StateResult<()> {
        let now = epoch_secs();
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        {
            let revisions = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
            let mut log = txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;
            for t in transitions {
                let key = revision_key(name, t.revision);
                if revisions.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                    return Err(StateError::NotFound(format!("{name} revision {}", t.revision)));
                }

                let entries = read_log(&log, name, t.revision)?;
                let current = entries.last().map(|e| e.status).unwrap_or(ReleaseStatus::Pending);
                if !current.can_transition_to(t.status) {
                    return Err(StateError::InvalidTransition {
                        name: name.to_string(),
                        revision: t.revision,
                        from: current.to_string(),
                        to: t.status.to_string(),
                    });
                }

                let entry = StatusEntry {
                    status: t.status,
                    at: now,
                    outcome: t.outcome.clone(),
                    note: t.note.clone(),
                };
                let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
                let seq = u32::try_from(entries.len()).unwrap_or(u32::MAX);
                let key = status_key(name, t.revision, seq);
                log.insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                debug!(release = %name, revision = t.revision, status = %t.status, "status appended");
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The number the next appended revision should use.
    pub fn next_revision(&self, name: &str) -> StateResult<Revision> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        Ok(latest_revision_in(&table, name)? + 1)
    }

    /// Get one revision, or the current one (highest `deployed`) when
    /// `revision` is `None`.
    pub fn get(&self, name: &str, revision: Option<Revision>) -> StateResult<Option<Release>> {
        match revision {
            Some(rev) => {
                let db = self.db()?;
                let txn = db.begin_read().map_err(map_err!(Transaction))?;
                let revisions = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
                let log = txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;
                let key = revision_key(name, rev);
                let Some(guard) = revisions.get(key.as_str()).map_err(map_err!(Read))? else {
                    return Ok(None);
                };
                let record: RevisionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                let entries = read_log(&log, name, rev)?;
                Ok(Some(Release::from_log(record, &entries)))
            }
            None => Ok(self
                .history(name)?
                .into_iter()
                .find(|r| r.status == ReleaseStatus::Deployed)),
        }
    }

    /// Highest revision regardless of status.
    pub fn latest(&self, name: &str) -> StateResult<Option<Release>> {
        Ok(self.history(name)?.into_iter().next())
    }

    /// All revisions of a release, most recent first.
    pub fn history(&self, name: &str) -> StateResult<Vec<Release>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let revisions = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        let log = txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;

        let (start, end) = prefix_range(name);
        let mut results = Vec::new();
        for entry in revisions
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RevisionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let entries = read_log(&log, name, record.revision)?;
            results.push(Release::from_log(record, &entries));
        }
        Ok(results)
    }

    /// Full status log of one revision, oldest first.
    pub fn status_log(&self, name: &str, revision: Revision) -> StateResult<Vec<StatusEntry>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let log = txn.open_table(STATUS_LOG).map_err(map_err!(Table))?;
        read_log(&log, name, revision)
    }

    /// Names of every release with at least one revision.
    pub fn list_releases(&self) -> StateResult<Vec<String>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        let mut names: Vec<String> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((name, _)) = key.value().split_once('/') {
                names.push(name.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Open the database file, waiting while another process has it open.
fn open_file(path: &Path) -> StateResult<Database> {
    let mut delay = OPEN_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_ATTEMPTS => {
                debug!(?path, attempt, "release store busy, retrying");
                std::thread::sleep(delay);
                delay = (delay * 2).min(OPEN_BACKOFF_MAX);
                attempt += 1;
            }
            Err(e) => return Err(StateError::Open(format!("{}: {e}", path.display()))),
        }
    }
}

fn latest_revision_in(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> StateResult<Revision> {
    let (start, end) = prefix_range(name);
    let last = table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?
        .next_back();
    match last {
        Some(entry) => {
            let (key, _) = entry.map_err(map_err!(Read))?;
            parse_revision(key.value())
        }
        None => Ok(0),
    }
}

fn read_log(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
    revision: Revision,
) -> StateResult<Vec<StatusEntry>> {
    let (start, end) = prefix_range(&revision_key(name, revision));
    let mut entries = Vec::new();
    for entry in table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?
    {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let status: StatusEntry =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        entries.push(status);
    }
    Ok(entries)
}

fn parse_revision(key: &str) -> StateResult<Revision> {
    key.rsplit_once('/')
        .and_then(|(_, rev)| rev.parse().ok())
        .ok_or_else(|| StateError::Deserialize(format!("malformed revision key `{key}`")))
}

/// Release names are DNS-label-like so they are safe in keys and resource names.
pub fn validate_name(name: &str) -> StateResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 53
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}

/// Seconds since the Unix epoch, as stored in records and status entries.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
