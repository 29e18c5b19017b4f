//! Exclusive store lock
//!
//! Every write to the store (build id allocation, report append, history
//! update) happens under an advisory `flock(2)` on `<root>/.store.lock`.
//! The lock has a timeout and logs when it is contended. It is released
//! when the guard is dropped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Default time to wait for the store lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Contention longer than this is logged
const CONTENTION_WARNING: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("I/O error on store lock: {0}")]
    Io(#[from] io::Error),
}

/// Held store lock
#[derive(Debug)]
pub struct StoreLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl StoreLock {
    pub const LOCK_FILENAME: &'static str = ".store.lock";

    /// Acquire the lock of the store rooted at `root`, waiting up to
    /// `timeout`.
    pub fn acquire(root: &Path, timeout: Duration) -> Result<Self, LockError> {
        fs::create_dir_all(root)?;

        let lock_path = root.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let mut warned = false;

        loop {
            match try_lock_exclusive(&lock_path) {
                Ok(lock_file) => {
                    if warned {
                        info!(
                            path = %lock_path.display(),
                            waited_seconds = start.elapsed().as_secs_f64(),
                            "store lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > CONTENTION_WARNING {
                        warn!(path = %lock_path.display(), "store lock contended, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: lock_path,
                    timeout,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(lock_path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(lock_path)?;

    // SAFETY: fd is owned by `file`, which outlives the call
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(file)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(lock_path: &Path) -> io::Result<File> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        }
        Err(e) => Err(e),
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is still owned by `lock_file`
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
