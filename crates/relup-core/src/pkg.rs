use crate::error::Result;
use crate::exec::Runner;
use crate::options::ConffilePolicy;
use nix::fcntl::{Flock, FlockArg};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// PackageManager
// ---------------------------------------------------------------------------

/// Narrow seam over the system package manager. The orchestration logic only
/// speaks this vocabulary, so the whole state machine runs against a fake in
/// tests and against apt/dpkg in production.
pub trait PackageManager {
    /// Refresh the package index.
    fn update(&self) -> Result<()>;
    /// Upgrade within the current release, never adding or removing packages.
    fn upgrade(&self, policy: ConffilePolicy) -> Result<()>;
    /// Upgrade without installing new packages; surfaces most new
    /// dependencies while risking no removal-driven breakage.
    fn minimal_upgrade(&self, policy: ConffilePolicy) -> Result<()>;
    /// Full resolve-and-upgrade across the package set, permitting removals
    /// and replacements.
    fn full_upgrade(&self, policy: ConffilePolicy) -> Result<()>;
    /// Purge obsolete and orphaned packages.
    fn autoremove_purge(&self) -> Result<()>;
    /// Clear the package cache.
    fn clean_cache(&self) -> Result<()>;
    /// Finish configuring any half-installed packages.
    fn configure_pending(&self) -> Result<()>;
    /// Repair a broken dependency graph.
    fn fix_broken(&self) -> Result<()>;
    /// Package database consistency audit; returns findings, empty when sane.
    fn audit(&self) -> Result<Vec<String>>;
    /// Packages held at a fixed version.
    fn held_packages(&self) -> Result<Vec<String>>;
    /// Full package-selection dump.
    fn selections(&self) -> Result<String>;
    /// Manually-installed package list.
    fn manual_packages(&self) -> Result<String>;
    /// Installed package-version list.
    fn installed_versions(&self) -> Result<String>;
    /// Whether the source-list modernization tool is available.
    fn can_modernize_sources(&self) -> bool;
    /// Migrate source lists to the modern structured format.
    fn modernize_sources(&self) -> Result<()>;
    /// Upgrade a single package to its newest available version.
    fn upgrade_package(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Apt
// ---------------------------------------------------------------------------

/// The production implementation, shelling out to apt-get, apt-mark, dpkg and
/// dpkg-query through the shared command runner.
pub struct Apt {
    runner: Runner,
    lock_files: Vec<PathBuf>,
}

impl Apt {
    pub fn new(runner: Runner, lock_files: Vec<PathBuf>) -> Self {
        Self { runner, lock_files }
    }

    fn conffile_args(policy: ConffilePolicy) -> &'static [&'static str] {
        match policy {
            // confdef lets dpkg pick the default where one exists, confold
            // answers "keep" for the rest; together they never prompt.
            ConffilePolicy::Keep => &[
                "-o",
                "Dpkg::Options::=--force-confdef",
                "-o",
                "Dpkg::Options::=--force-confold",
            ],
            ConffilePolicy::Replace => &["-o", "Dpkg::Options::=--force-confnew"],
        }
    }

    fn apt_get(&self, policy: ConffilePolicy, args: &[&str]) -> Result<()> {
        let mut full: Vec<&str> = vec!["-y"];
        full.extend_from_slice(Self::conffile_args(policy));
        full.extend_from_slice(args);
        self.runner.run("apt-get", &full)
    }

    /// Best-effort recovery of the package database after a failed run:
    /// finish pending configuration, then clear stale apt/dpkg lock files,
    /// but only those no live process still holds.
    pub fn recover_database(&self) {
        info!("attempting package database recovery");
        if let Err(e) = self.configure_pending() {
            warn!(error = %e, "dpkg --configure -a did not complete");
        }
        for lock in &self.lock_files {
            if !lock.exists() {
                continue;
            }
            if lock_is_free(lock) {
                debug!(path = %lock.display(), "removing stale package-manager lock");
                if let Err(e) = std::fs::remove_file(lock) {
                    warn!(path = %lock.display(), error = %e, "could not remove stale lock");
                }
            } else {
                warn!(
                    path = %lock.display(),
                    "lock is held by a live process, leaving it in place"
                );
            }
        }
    }
}

/// Probe whether an advisory lock on `path` can be taken right now. Used to
/// distinguish a stale lock file from one held by a live package operation.
fn lock_is_free(path: &Path) -> bool {
    let Ok(file) = std::fs::OpenOptions::new().read(true).open(path) else {
        return false;
    };
    Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok()
}

impl PackageManager for Apt {
    fn update(&self) -> Result<()> {
        self.runner.run("apt-get", &["update"])
    }

    fn upgrade(&self, policy: ConffilePolicy) -> Result<()> {
        self.apt_get(policy, &["upgrade"])
    }

    fn minimal_upgrade(&self, policy: ConffilePolicy) -> Result<()> {
        self.apt_get(policy, &["upgrade", "--without-new-pkgs"])
    }

    fn full_upgrade(&self, policy: ConffilePolicy) -> Result<()> {
        self.apt_get(policy, &["dist-upgrade"])
    }

    fn autoremove_purge(&self) -> Result<()> {
        self.apt_get(ConffilePolicy::Keep, &["autoremove", "--purge"])
    }

    fn clean_cache(&self) -> Result<()> {
        self.runner.run("apt-get", &["clean"])
    }

    fn configure_pending(&self) -> Result<()> {
        self.runner.run("dpkg", &["--configure", "-a"])
    }

    fn fix_broken(&self) -> Result<()> {
        self.apt_get(ConffilePolicy::Keep, &["--fix-broken", "install"])
    }

    fn audit(&self) -> Result<Vec<String>> {
        // dpkg --audit exits non-zero when it has findings; the findings are
        // the answer, not a failure.
        let (_, out) = self.runner.output_unchecked("dpkg", &["--audit"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn held_packages(&self) -> Result<Vec<String>> {
        let out = self.runner.output("apt-mark", &["showhold"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn selections(&self) -> Result<String> {
        self.runner.output("dpkg", &["--get-selections", "*"])
    }

    fn manual_packages(&self) -> Result<String> {
        self.runner.output("apt-mark", &["showmanual"])
    }

    fn installed_versions(&self) -> Result<String> {
        self.runner
            .output("dpkg-query", &["-W", "-f", "${Package} ${Version}\n"])
    }

    fn can_modernize_sources(&self) -> bool {
        match self.runner.output_unchecked("apt", &["--help"]) {
            Ok((0, help)) => help.contains("modernize-sources"),
            _ => false,
        }
    }

    fn modernize_sources(&self) -> Result<()> {
        self.runner.run("apt", &["modernize-sources", "-y"])
    }

    fn upgrade_package(&self, name: &str) -> Result<()> {
        self.apt_get(ConffilePolicy::Keep, &["install", "--only-upgrade", name])
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::UpgradeError;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Scripted package manager recording every call in order. Operations
    /// listed in `failing` return a command failure. The call log is shared
    /// so tests keep a handle after the fake moves into a context.
    #[derive(Default)]
    pub struct FakePackageManager {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub failing: HashSet<String>,
        pub held: Vec<String>,
        pub audit_findings: Vec<String>,
        pub modernize_available: bool,
    }

    impl FakePackageManager {
        pub fn new() -> Self {
            Self {
                modernize_available: true,
                ..Self::default()
            }
        }

        pub fn calls_handle(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.calls)
        }

        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn call(&self, op: &str) -> Result<()> {
            self.calls.lock().unwrap().push(op.to_string());
            if self.failing.contains(op) {
                return Err(UpgradeError::CommandFailed {
                    command: op.to_string(),
                    status: 100,
                });
            }
            Ok(())
        }
    }

    impl PackageManager for FakePackageManager {
        fn update(&self) -> Result<()> {
            self.call("update")
        }
        fn upgrade(&self, policy: ConffilePolicy) -> Result<()> {
            self.call(&format!("upgrade:{}", policy.as_str()))
        }
        fn minimal_upgrade(&self, policy: ConffilePolicy) -> Result<()> {
            self.call(&format!("minimal-upgrade:{}", policy.as_str()))
        }
        fn full_upgrade(&self, policy: ConffilePolicy) -> Result<()> {
            self.call(&format!("full-upgrade:{}", policy.as_str()))
        }
        fn autoremove_purge(&self) -> Result<()> {
            self.call("autoremove")
        }
        fn clean_cache(&self) -> Result<()> {
            self.call("clean")
        }
        fn configure_pending(&self) -> Result<()> {
            self.call("configure-pending")
        }
        fn fix_broken(&self) -> Result<()> {
            self.call("fix-broken")
        }
        fn audit(&self) -> Result<Vec<String>> {
            self.call("audit")?;
            Ok(self.audit_findings.clone())
        }
        fn held_packages(&self) -> Result<Vec<String>> {
            self.call("held")?;
            Ok(self.held.clone())
        }
        fn selections(&self) -> Result<String> {
            self.call("selections")?;
            Ok("relup-core\tinstall\n".to_string())
        }
        fn manual_packages(&self) -> Result<String> {
            self.call("manual")?;
            Ok("relup-core\n".to_string())
        }
        fn installed_versions(&self) -> Result<String> {
            self.call("versions")?;
            Ok("relup-core 0.3.0\n".to_string())
        }
        fn can_modernize_sources(&self) -> bool {
            self.modernize_available
        }
        fn modernize_sources(&self) -> Result<()> {
            self.call("modernize-sources")
        }
        fn upgrade_package(&self, name: &str) -> Result<()> {
            self.call(&format!("upgrade-package:{name}"))
        }
    }
}
