//! Advisory file locks with a bounded wait.
//!
//! Locks are taken on sidecar `.lock` files so that the data file itself can
//! be replaced atomically by rename while the lock is held.

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A held lock, released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, waiting at most `timeout`
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, timeout, |f| FileExt::try_lock_exclusive(f))
    }

    /// Acquire a shared lock, waiting at most `timeout`
    pub fn shared(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, timeout, |f| FileExt::try_lock_shared(f))
    }

    fn acquire<F>(path: &Path, timeout: Duration, try_lock: F) -> Result<Self>
    where
        F: Fn(&File) -> std::io::Result<()>,
    {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match try_lock(&file) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "lock {:?} still held after {:?}",
                            path, timeout
                        )));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}
