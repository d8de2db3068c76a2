use crate::error::Result;
use crate::io;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// MarkerStore
// ---------------------------------------------------------------------------

/// Durable record of completed phases: a small key-value set mapping step name
/// to completion timestamp. Presence of a marker means the step's
/// externally-visible effects are already applied and must not be reapplied.
///
/// Markers are only ever created or bulk-removed; never mutated in place.
pub trait MarkerStore {
    fn is_complete(&self, step: &str) -> bool;
    fn mark_complete(&self, step: &str) -> Result<()>;
    /// Remove every marker, forcing a clean re-run.
    fn reset(&self) -> Result<()>;
    /// Names of all completed steps, for reporting.
    fn completed(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// FsMarkerStore
// ---------------------------------------------------------------------------

/// One file per step under the state directory; the file body is the RFC 3339
/// completion time. Written atomically so a crash never leaves a half-written
/// marker that would be mistaken for a completed step.
pub struct FsMarkerStore {
    dir: PathBuf,
    dry_run: bool,
}

impl FsMarkerStore {
    pub fn new(dir: PathBuf, dry_run: bool) -> Self {
        Self { dir, dry_run }
    }
}

impl MarkerStore for FsMarkerStore {
    fn is_complete(&self, step: &str) -> bool {
        self.dir.join(step).is_file()
    }

    fn mark_complete(&self, step: &str) -> Result<()> {
        if self.dry_run {
            tracing::debug!(step, "dry-run: not writing completion marker");
            return Ok(());
        }
        let stamp = Utc::now().to_rfc3339();
        io::atomic_write(&self.dir.join(step), stamp.as_bytes())?;
        tracing::debug!(step, "completion marker written");
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn completed(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut steps: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        steps.sort();
        steps
    }
}

// ---------------------------------------------------------------------------
// MemoryMarkerStore
// ---------------------------------------------------------------------------

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryMarkerStore {
    steps: Mutex<BTreeSet<String>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completed(steps: &[&str]) -> Self {
        let store = Self::new();
        for step in steps {
            store.steps.lock().unwrap().insert(step.to_string());
        }
        store
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn is_complete(&self, step: &str) -> bool {
        self.steps.lock().unwrap().contains(step)
    }

    fn mark_complete(&self, step: &str) -> Result<()> {
        self.steps.lock().unwrap().insert(step.to_string());
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.steps.lock().unwrap().clear();
        Ok(())
    }

    fn completed(&self) -> Vec<String> {
        self.steps.lock().unwrap().iter().cloned().collect()
    }
}
