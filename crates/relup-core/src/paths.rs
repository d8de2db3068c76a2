use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Well-known locations, relative to the run root
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = "var/lib/relup";
pub const MARKERS_DIR: &str = "var/lib/relup/markers";
pub const SOURCES_BACKUP_DIR: &str = "var/lib/relup/sources-backup";
pub const LOG_FILE: &str = "var/log/relup.log";
pub const LOCK_FILE: &str = "run/relup.lock";
pub const OS_RELEASE: &str = "etc/os-release";
pub const SOURCES_LIST: &str = "etc/apt/sources.list";
pub const SOURCES_PARTS: &str = "etc/apt/sources.list.d";
pub const REBOOT_REQUIRED: &str = "run/reboot-required";

/// apt/dpkg lock files that may be left stale after an interrupted package
/// operation. Only ever removed when no live process holds them.
pub const PACKAGE_LOCKS: &[&str] = &[
    "var/lib/dpkg/lock",
    "var/lib/dpkg/lock-frontend",
    "var/lib/apt/lists/lock",
    "var/cache/apt/archives/lock",
];

// ---------------------------------------------------------------------------
// SystemPaths
// ---------------------------------------------------------------------------

/// All filesystem locations the orchestrator touches, derived from one root
/// prefix so the entire tree can be pointed at a scratch directory in tests.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    root: PathBuf,
}

impl SystemPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.root.join(MARKERS_DIR)
    }

    pub fn sources_backup_dir(&self) -> PathBuf {
        self.root.join(SOURCES_BACKUP_DIR)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn os_release(&self) -> PathBuf {
        self.root.join(OS_RELEASE)
    }

    pub fn sources_list(&self) -> PathBuf {
        self.root.join(SOURCES_LIST)
    }

    pub fn sources_parts(&self) -> PathBuf {
        self.root.join(SOURCES_PARTS)
    }

    pub fn reboot_required(&self) -> PathBuf {
        self.root.join(REBOOT_REQUIRED)
    }

    pub fn package_locks(&self) -> Vec<PathBuf> {
        PACKAGE_LOCKS.iter().map(|p| self.root.join(p)).collect()
    }
}
