//! Per-proposal writer locks.
//!
//! A writer holds two locks for the whole operation: an in-process async
//! mutex and an exclusive advisory lock on a file next to the proposal's
//! repository. The file lock keeps separate processes that share a data
//! directory (two CLI invocations, say) from interleaving their ref moves
//! and record writes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{StoreError, VersioningError};
use crate::models::DbId;

/// How long a writer waits for another process before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

type Entries = Mutex<HashMap<DbId, Arc<AsyncMutex<()>>>>;

/// Table of per-proposal mutexes. Entries are dropped once nobody holds
/// or waits for them.
pub struct LockTable {
    entries: Arc<Entries>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Wait for exclusive write access to `proposal_id`. `lock_path` is the
    /// proposal's lock file; it is created if missing.
    pub async fn acquire(
        &self,
        proposal_id: DbId,
        lock_path: &Path,
    ) -> Result<ProposalGuard, VersioningError> {
        let mutex = lock_entries(&self.entries)
            .entry(proposal_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = mutex.clone().lock_owned().await;

        let mut held = ProposalGuard {
            proposal_id,
            guard: Some(guard),
            mutex,
            entries: Arc::clone(&self.entries),
            file: None,
        };
        held.file = Some(lock_file(proposal_id, lock_path, self.timeout).await?);
        Ok(held)
    }

    /// Number of proposals with a live entry.
    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Write access to one proposal. Both locks are released on drop.
pub struct ProposalGuard {
    proposal_id: DbId,
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<AsyncMutex<()>>,
    entries: Arc<Entries>,
    // Closing the file releases the advisory lock.
    file: Option<File>,
}

impl Drop for ProposalGuard {
    fn drop(&mut self) {
        self.file.take();
        self.guard.take();
        let mut entries = lock_entries(&self.entries);
        // One reference in the table, one here: nobody else is waiting.
        if Arc::strong_count(&self.mutex) == 2 {
            entries.remove(&self.proposal_id);
        }
    }
}

async fn lock_file(
    proposal_id: DbId,
    path: &Path,
    timeout: Duration,
) -> Result<File, VersioningError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| VersioningError::Store(StoreError::IoError(e)))?;

    let deadline = Instant::now() + timeout;
    let mut waited = false;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                if waited {
                    debug!(proposal_id, "acquired lock after waiting for another process");
                }
                return Ok(file);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    warn!(proposal_id, path = %path.display(), "timed out waiting for proposal lock");
                    return Err(VersioningError::Locked { proposal_id });
                }
                waited = true;
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => return Err(VersioningError::Store(StoreError::IoError(e))),
        }
    }
}

fn lock_entries(entries: &Entries) -> MutexGuard<'_, HashMap<DbId, Arc<AsyncMutex<()>>>> {
    entries.lock().unwrap_or_else(|poisoned| {
        warn!("proposal lock table was poisoned, recovering");
        poisoned.into_inner()
    })
}
