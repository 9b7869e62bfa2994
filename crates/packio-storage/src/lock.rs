//! Partition locking
//!
//! Mutations of a partition's hash bookkeeping (the invalidation log and the
//! suffix hash cache) are serialized with an exclusive `flock` on
//! `<partition>/.lock`. Acquisition polls with a bounded wait so a stuck
//! holder surfaces as [`Error::LockTimeout`] instead of a hang.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use packio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

/// Lock file name inside a partition directory
pub const LOCK_FILE: &str = ".lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive lock on a partition directory, released on drop
pub struct PartitionLock {
    _flock: Flock<File>,
    dir: PathBuf,
}

impl PartitionLock {
    /// Lock `dir`, waiting at most `timeout`
    pub fn acquire(dir: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    trace!("locked partition {}", dir.display());
                    return Ok(Self {
                        _flock: flock,
                        dir: dir.to_path_buf(),
                    });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                    file = returned;
                }
                Err((_, errno)) => return Err(Error::Io(errno.into())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    path: dir.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(RETRY_INTERVAL.min(deadline - now));
        }
    }

    /// Directory this lock guards
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for PartitionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLock")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock = PartitionLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        assert_eq!(lock.dir(), dir.path());
        assert!(dir.path().join(LOCK_FILE).exists());
        drop(lock);

        PartitionLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_timeout_while_held() {
        let dir = tempdir().unwrap();
        let _held = PartitionLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();

        let started = Instant::now();
        let err = PartitionLock::acquire(dir.path(), Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let dir = tempdir().unwrap();
        let held = PartitionLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let path = dir.path().to_path_buf();
        let flag = Arc::clone(&acquired);
        let waiter = std::thread::spawn(move || {
            let _lock = PartitionLock::acquire(&path, Duration::from_secs(5)).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempdir().unwrap();
        let err = PartitionLock::acquire(&dir.path().join("gone"), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
