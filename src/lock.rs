//! Advisory repository lock
//!
//! Scheduled snapshot jobs and interactive commands may run against the same
//! timeline. Callers that opt in take a [`RepositoryLock`] before opening the
//! timeline and hold it until the state has been saved. The timeline itself
//! never checks the lock.
//!
//! The lock is a `.lock` file created exclusively inside the repository
//! directory. It records `pid@hostname` of the holder and is removed when
//! the guard is dropped.

use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// File name of the lock inside the repository directory
pub const LOCK_FILE: &str = ".lock";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Guard for an acquired repository lock
#[derive(Debug)]
pub struct RepositoryLock {
    path: PathBuf,
}

impl RepositoryLock {
    /// Try to take the lock, polling until `timeout` has passed
    ///
    /// Returns `Ok(None)` when another holder still has the lock after the
    /// timeout. That is not an error: someone else is already handling the
    /// repository.
    ///
    /// # Errors
    ///
    /// [`TimelineError::Io`](crate::TimelineError::Io) for failures other
    /// than the lock file already existing (e.g. missing repository
    /// directory).
    pub fn acquire(repository: &Path, timeout: Duration) -> Result<Option<Self>> {
        let path = repository.join(LOCK_FILE);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", holder_id())?;
                    debug!("acquired lock {:?}", path);
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        debug!("lock {:?} is held by [{}]", path, Self::holder(repository).unwrap_or_default());
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Holder recorded in the lock file of `repository`, if locked
    pub fn holder(repository: &Path) -> Option<String> {
        fs::read_to_string(repository.join(LOCK_FILE))
            .ok()
            .map(|content| content.trim().to_string())
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("Failed to release lock {:?}: {}", self.path, e);
        } else {
            debug!("released lock {:?}", self.path);
        }
    }
}

fn holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}
