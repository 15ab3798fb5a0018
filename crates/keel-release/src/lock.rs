//! Per-release writer locks.
//!
//! One async mutex per release name. tokio's mutex is fair, so a second
//! deploy of the same release queues behind the first instead of failing.
//! Different releases never contend. Entries nobody holds or waits on are
//! dropped from the map on the next acquire.
//!
//! With a lock directory, the holder also takes an exclusive lock on
//! `<dir>/<release>.lock`, so writers in other processes queue the same way.
//! The OS releases the file lock when the guard drops or the process exits.

use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{ReleaseError, ReleaseResult};

#[derive(Default)]
pub struct ReleaseLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dir: Option<PathBuf>,
}

/// Exclusive write access to one release until dropped.
pub struct ReleaseGuard {
    _file: Option<File>,
    _local: OwnedMutexGuard<()>,
}

impl ReleaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using the same `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            dir: Some(dir.into()),
        }
    }

    /// Wait for exclusive write access to `name`.
    pub async fn acquire(&self, name: &str) -> ReleaseResult<ReleaseGuard> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(name.to_string()).or_default().clone()
        };
        let local = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(release = %name, "waiting for release lock");
                lock.lock_owned().await
            }
        };

        let file = match &self.dir {
            Some(dir) => Some(
                lock_file(dir, name)
                    .await
                    .map_err(|source| ReleaseError::Lock {
                        release: name.to_string(),
                        source,
                    })?,
            ),
            None => None,
        };
        Ok(ReleaseGuard {
            _file: file,
            _local: local,
        })
    }
}

async fn lock_file(dir: &Path, name: &str) -> io::Result<File> {
    let path = dir.join(format!("{name}.lock"));
    tokio::task::spawn_blocking(move || -> io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => return Ok(file),
            Err(TryLockError::WouldBlock) => debug!(?path, "waiting for release lock file"),
            Err(TryLockError::Error(err)) => return Err(err),
        }
        file.lock()?;
        Ok(file)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_is_exclusive() {
        let locks = ReleaseLocks::new();
        let guard = locks.acquire("shop").await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), locks.acquire("shop")).await;
        assert!(waiting.is_err());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire("shop")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let locks = ReleaseLocks::new();
        let _shop = locks.acquire("shop").await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire("billing")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = ReleaseLocks::new();
        for name in ["a", "b", "c"] {
            drop(locks.acquire(name).await.unwrap());
        }
        let _held = locks.acquire("d").await.unwrap();
        let _also = locks.acquire("e").await.unwrap();

        let mut names: Vec<String> = locks.locks.lock().await.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn lock_dir_excludes_a_second_set_of_locks() {
        let dir = tempfile::tempdir().unwrap();
        let first = ReleaseLocks::with_dir(dir.path());
        let second = ReleaseLocks::with_dir(dir.path());

        let guard = first.acquire("shop").await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(100), second.acquire("shop")).await;
        assert!(waiting.is_err());
        assert!(second.acquire("billing").await.is_ok());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_secs(5), second.acquire("shop")).await;
        assert!(again.is_ok());
    }
}
