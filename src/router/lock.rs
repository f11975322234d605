//! Advisory file locking for the persisted router state.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// A lock older than this is considered abandoned by a dead process.
const LOCK_STALE_MS: u64 = 5000;

/// How long a writer waits for a contended lock before giving up.
const LOCK_WAIT: Duration = Duration::from_millis(500);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Acquire an exclusive lock on a file, failing immediately if held.
pub fn acquire_lock(path: &Path) -> Result<LockHandle, Error> {
    let lock_path = PathBuf::from(format!("{}.lock", path.display()));

    if lock_path.exists() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let modified_ms = lock_path
            .metadata()?
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        if now_ms.saturating_sub(modified_ms) < LOCK_STALE_MS {
            return Err(Error::State(format!(
                "Lock file is held: {}",
                lock_path.display()
            )));
        }

        tracing::warn!("Removing stale lock: {}", lock_path.display());
        std::fs::remove_file(&lock_path).ok();
    }

    let mut lock_file = File::create(&lock_path)?;
    lock_file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    lock_file.sync_all()?;

    tracing::trace!("Acquired lock: {}", lock_path.display());

    Ok(LockHandle { lock_path })
}

/// Acquire the lock, retrying briefly while another writer holds it.
pub fn acquire_lock_waiting(path: &Path) -> Result<LockHandle, Error> {
    let deadline = std::time::Instant::now() + LOCK_WAIT;
    loop {
        match acquire_lock(path) {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                if std::time::Instant::now() >= deadline {
                    return Err(e);
                }
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
        }
    }
}

/// Lock handle - releases lock when dropped.
pub struct LockHandle {
    lock_path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        } else {
            tracing::trace!("Released lock: {}", self.lock_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let state_file = temp_dir.path().join("router-state.json");
        fs::write(&state_file, "{}").unwrap();

        let lock1 = acquire_lock(&state_file);
        assert!(lock1.is_ok());

        let lock2 = acquire_lock(&state_file);
        assert!(lock2.is_err());

        drop(lock1);

        let lock3 = acquire_lock(&state_file);
        assert!(lock3.is_ok());
    }

    #[test]
    fn waiting_acquire_gets_the_lock_after_release() {
        let temp_dir = TempDir::new().unwrap();
        let state_file = temp_dir.path().join("router-state.json");
        fs::write(&state_file, "{}").unwrap();

        let lock = acquire_lock(&state_file).unwrap();
        let path = state_file.clone();
        let waiter = std::thread::spawn(move || acquire_lock_waiting(&path));
        std::thread::sleep(Duration::from_millis(100));
        drop(lock);

        assert!(waiter.join().unwrap().is_ok());
    }
}
