//! File-based mutual exclusion shared across processes and threads.
//!
//! Generating a metatile is expensive, so at most one worker may generate a
//! given metatile at a time, even across separate server processes sharing
//! a cache directory. The only shared mutable state is a lock file named
//! after the resource: whoever creates it owns the resource, everyone else
//! polls until the file disappears and then re-checks the cache instead of
//! regenerating.
//!
//! There is no staleness detection: a holder that crashes without removing
//! its lock file blocks that resource until the file is cleaned up
//! externally. This mirrors the behavior of the process-external tools
//! that share these lock files.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default interval between polls while waiting on another holder.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors from lock file management.
///
/// "The resource is already locked" is not an error; it is the wait path of
/// [`LockManager::acquire_or_wait`]. These errors are I/O failures creating
/// or removing lock files, and are fatal to the request that hit them.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to create lock file {path}: {source}")]
    Create {
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to remove lock file {path}: {source}")]
    Remove {
        path: PathBuf,
        source: io::Error,
    },
}

/// Creates and removes named lock files in a shared directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    directory: PathBuf,
    poll_interval: Duration,
}

/// Ownership of a named lock resource.
///
/// Released explicitly with [`LockGuard::release`]; dropping the guard
/// without releasing removes the lock file on a best-effort basis so an
/// early return or panic cannot leave the resource locked by a live
/// process.
#[must_use = "dropping a LockGuard releases the lock"]
pub struct LockGuard {
    path: Option<PathBuf>,
}

impl LockManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        // the file must land directly in the lock directory, so any
        // separator in the resource name is replaced
        let safe: String = resource
            .chars()
            .map(|c| if c == '/' || c == '\\' { '#' } else { c })
            .collect();
        self.directory.join(format!("{safe}.lck"))
    }

    /// Acquire the named lock, or wait for the current holder to finish.
    ///
    /// Returns `Ok(Some(guard))` when this caller created the lock file and
    /// now owns the resource. Returns `Ok(None)` after another holder has
    /// released the lock: the resource the lock guarded has been produced
    /// by someone else, and the caller should re-check the cache rather
    /// than generate it again.
    ///
    /// The wait path sleeps between polls and never busy-spins.
    pub async fn acquire_or_wait(&self, resource: &str) -> Result<Option<LockGuard>, LockError> {
        let path = self.lock_path(resource);
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    debug!(resource, "acquired lock");
                    return Ok(Some(LockGuard {
                        path: Some(path),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(resource, "lock held elsewhere, waiting");
                    while path.exists() {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // lock directory missing; create it and retry once per
                    // iteration. Benign races with other creators are fine.
                    if let Err(mkdir_err) = std::fs::create_dir_all(&self.directory) {
                        return Err(LockError::Create {
                            path,
                            source: mkdir_err,
                        });
                    }
                }
                Err(e) => {
                    return Err(LockError::Create { path, source: e });
                }
            }
        }
    }
}

impl LockGuard {
    /// Remove the lock file, releasing the resource.
    pub fn release(mut self) -> Result<(), LockError> {
        if let Some(path) = self.path.take() {
            std::fs::remove_file(&path).map_err(|source| LockError::Remove { path, source })?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove lock file on drop");
            }
        }
    }
}
