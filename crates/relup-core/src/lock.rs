use crate::error::{Result, UpgradeError};
use crate::io;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a second invocation waits for the lock before failing fatally.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Exclusive advisory lock guaranteeing a single live orchestrator instance.
///
/// The lock is tied to one well-known file; the holder's PID is written into
/// it for diagnosis. Dropping the guard releases the lock, and [`release`]
/// is idempotent so the paired cleanup action is safe on every exit path.
///
/// [`release`]: LockFile::release
#[derive(Debug)]
pub struct LockFile {
    flock: Option<Flock<File>>,
    path: PathBuf,
}

impl LockFile {
    /// Take the lock, blocking up to `timeout`. Creates the parent directory
    /// if absent. Timing out is fatal, not transient: another instance is
    /// either running or stuck, and the operator must decide.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            io::ensure_dir(parent)?;
        }
        let deadline = Instant::now() + timeout;
        let mut waiting_logged = false;
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    flock.set_len(0)?;
                    (&*flock).write_all(format!("{}\n", std::process::id()).as_bytes())?;
                    debug!(path = %path.display(), pid = std::process::id(), "lock acquired");
                    return Ok(Self {
                        flock: Some(flock),
                        path: path.to_path_buf(),
                    });
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    if Instant::now() >= deadline {
                        return Err(UpgradeError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    if !waiting_logged {
                        warn!(
                            path = %path.display(),
                            "lock is held by another instance, waiting up to {}s",
                            timeout.as_secs()
                        );
                        waiting_logged = true;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err((_, errno)) => return Err(UpgradeError::Io(errno.into())),
            }
        }
    }

    /// Release the lock. Safe to call repeatedly, and safe to call even if
    /// the guard never held the lock.
    pub fn release(&mut self) {
        if self.flock.take().is_some() {
            debug!(path = %self.path.display(), "lock released");
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_parent_and_records_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/relup.lock");
        let _lock = LockFile::acquire(&path, Duration::ZERO).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn second_acquire_times_out_with_lock_exit_code() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relup.lock");
        let _held = LockFile::acquire(&path, Duration::ZERO).unwrap();

        let err = LockFile::acquire(&path, Duration::ZERO).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn release_is_idempotent_and_frees_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relup.lock");

        let mut lock = LockFile::acquire(&path, Duration::ZERO).unwrap();
        lock.release();
        lock.release();

        // Lock must be re-acquirable after release.
        let _again = LockFile::acquire(&path, Duration::ZERO).unwrap();
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relup.lock");
        {
            let _lock = LockFile::acquire(&path, Duration::ZERO).unwrap();
        }
        let _again = LockFile::acquire(&path, Duration::ZERO).unwrap();
    }
}
