use crate::error::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a child gets between SIGTERM and SIGKILL during finalization.
pub const CHILD_KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ChildTracker
// ---------------------------------------------------------------------------

/// PIDs of external commands currently in flight. The command runner registers
/// a child before waiting on it and removes it after; anything still present
/// at finalization time is a stray that must not outlive the run.
#[derive(Default)]
pub struct ChildTracker {
    pids: Mutex<HashSet<i32>>,
}

impl ChildTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, pid: i32) {
        self.pids.lock().unwrap().insert(pid);
    }

    pub fn unregister(&self, pid: i32) {
        self.pids.lock().unwrap().remove(&pid);
    }

    fn alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    /// Terminate surviving children: graceful signal first, then a bounded
    /// grace period, then a forced kill.
    pub fn kill_survivors(&self, grace: Duration) {
        let pids: Vec<i32> = self.pids.lock().unwrap().iter().copied().collect();
        if pids.is_empty() {
            return;
        }
        for &pid in &pids {
            debug!(pid, "terminating stray child");
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if pids.iter().all(|&pid| !Self::alive(pid)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        for &pid in &pids {
            if Self::alive(pid) {
                warn!(pid, "child did not exit in time, sending SIGKILL");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CleanupRegistry
// ---------------------------------------------------------------------------

type ActionFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct CleanupAction {
    name: &'static str,
    run: ActionFn,
}

/// Ordered ledger of reversible work: named cleanup actions, files this run
/// created, and backups of files it modified. Drained exactly once by
/// [`CleanupRegistry::finalize`] on every exit path.
pub struct CleanupRegistry {
    actions: Vec<CleanupAction>,
    created: Vec<PathBuf>,
    backups: Vec<(PathBuf, PathBuf)>,
    children: Arc<ChildTracker>,
    finalized: bool,
}

impl CleanupRegistry {
    pub fn new(children: Arc<ChildTracker>) -> Self {
        Self {
            actions: Vec::new(),
            created: Vec::new(),
            backups: Vec::new(),
            children,
            finalized: false,
        }
    }

    /// Register a named cleanup action, run LIFO at finalization.
    pub fn register<F>(&mut self, name: &'static str, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        debug!(action = name, "cleanup action registered");
        self.actions.push(CleanupAction {
            name,
            run: Box::new(action),
        });
    }

    /// Record a file this run newly created. Removed on abnormal termination.
    pub fn track_created(&mut self, path: &Path) {
        debug!(path = %path.display(), "created file tracked for rollback");
        self.created.push(path.to_path_buf());
    }

    /// Record a modified file and its backup copy. Restored on abnormal
    /// termination; the backup is discarded on success.
    pub fn track_modified(&mut self, original: &Path, backup: &Path) {
        debug!(
            path = %original.display(),
            backup = %backup.display(),
            "modified file tracked for rollback"
        );
        self.backups
            .push((original.to_path_buf(), backup.to_path_buf()));
    }

    pub fn has_finalized(&self) -> bool {
        self.finalized
    }

    /// Drain the ledger. `failed` selects the rollback path; `db_recovery`
    /// is the package-database repair hook, invoked only on failure.
    ///
    /// Nothing in here propagates an error: a failure during cleanup is
    /// logged and the remaining entries still run, and the caller's exit code
    /// is never changed by this function.
    pub fn finalize(&mut self, failed: bool, db_recovery: Option<&dyn Fn()>) {
        // Reentrancy guard: cleanup runs exactly once. Repeat signals are
        // already ignored by the signal latch, so nothing can interrupt this.
        if self.finalized {
            return;
        }
        self.finalized = true;

        self.children.kill_survivors(CHILD_KILL_GRACE);

        // Strict reverse-of-registration order.
        while let Some(action) = self.actions.pop() {
            debug!(action = action.name, "running cleanup action");
            if let Err(e) = (action.run)() {
                warn!(action = action.name, error = %e, "cleanup action failed");
            }
        }

        if failed {
            for path in self.created.drain(..).rev() {
                if path.exists() {
                    debug!(path = %path.display(), "removing file created by failed run");
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "could not remove created file");
                    }
                }
            }
            for (original, backup) in self.backups.drain(..).rev() {
                if !backup.exists() {
                    warn!(backup = %backup.display(), "backup missing, cannot restore");
                    continue;
                }
                debug!(path = %original.display(), "restoring from backup");
                if let Err(e) = std::fs::copy(&backup, &original) {
                    warn!(path = %original.display(), error = %e, "restore failed");
                    continue;
                }
                if let Err(e) = std::fs::remove_file(&backup) {
                    debug!(backup = %backup.display(), error = %e, "could not remove backup");
                }
            }
            if let Some(recover) = db_recovery {
                recover();
            }
        } else {
            for (_, backup) in self.backups.drain(..) {
                if backup.exists() {
                    debug!(backup = %backup.display(), "discarding backup after success");
                    if let Err(e) = std::fs::remove_file(&backup) {
                        debug!(backup = %backup.display(), error = %e, "could not remove backup");
                    }
                }
            }
            self.created.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpgradeError;
    use tempfile::TempDir;

    fn registry() -> CleanupRegistry {
        CleanupRegistry::new(ChildTracker::new())
    }

    #[test]
    fn actions_run_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            reg.register(name, move || {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        reg.finalize(false, None);
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn failing_action_does_not_stop_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry();
        {
            let order = Arc::clone(&order);
            reg.register("survivor", move || {
                order.lock().unwrap().push("survivor");
                Ok(())
            });
        }
        reg.register("failing", || {
            Err(UpgradeError::CommandFailed {
                command: "x".into(),
                status: 1,
            })
        });
        reg.finalize(false, None);
        assert_eq!(*order.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn finalize_runs_exactly_once() {
        let count = Arc::new(Mutex::new(0));
        let mut reg = registry();
        {
            let count = Arc::clone(&count);
            reg.register("once", move || {
                *count.lock().unwrap() += 1;
                Ok(())
            });
        }
        reg.finalize(false, None);
        reg.finalize(true, None);
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(reg.has_finalized());
    }

    #[test]
    fn failure_removes_created_and_restores_modified() {
        let dir = TempDir::new().unwrap();
        let created = dir.path().join("created.txt");
        let modified = dir.path().join("modified.txt");
        let backup = dir.path().join("modified.txt.bak.test");

        std::fs::write(&created, "new").unwrap();
        std::fs::write(&backup, "original content").unwrap();
        std::fs::write(&modified, "rewritten content").unwrap();

        let mut reg = registry();
        reg.track_created(&created);
        reg.track_modified(&modified, &backup);
        reg.finalize(true, None);

        assert!(!created.exists());
        assert_eq!(
            std::fs::read_to_string(&modified).unwrap(),
            "original content"
        );
        assert!(!backup.exists(), "backup is consumed by the restore");
    }

    #[test]
    fn success_discards_backups_and_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let created = dir.path().join("created.txt");
        let modified = dir.path().join("modified.txt");
        let backup = dir.path().join("modified.txt.bak.test");

        std::fs::write(&created, "new").unwrap();
        std::fs::write(&backup, "original content").unwrap();
        std::fs::write(&modified, "rewritten content").unwrap();

        let mut reg = registry();
        reg.track_created(&created);
        reg.track_modified(&modified, &backup);
        reg.finalize(false, None);

        assert!(created.exists());
        assert_eq!(
            std::fs::read_to_string(&modified).unwrap(),
            "rewritten content"
        );
        assert!(!backup.exists());
    }

    #[test]
    fn db_recovery_runs_only_on_failure() {
        let called = Arc::new(Mutex::new(false));

        let mut reg = registry();
        {
            let called = Arc::clone(&called);
            let hook = move || *called.lock().unwrap() = true;
            reg.finalize(false, Some(&hook));
        }
        assert!(!*called.lock().unwrap());

        let mut reg = registry();
        {
            let called = Arc::clone(&called);
            let hook = move || *called.lock().unwrap() = true;
            reg.finalize(true, Some(&hook));
        }
        assert!(*called.lock().unwrap());
    }
}
