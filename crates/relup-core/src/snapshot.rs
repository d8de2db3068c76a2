use crate::error::Result;
use crate::io;
use crate::paths::SystemPaths;
use crate::pkg::PackageManager;
use tracing::{debug, info};

/// Record of the package state at a point in time, written into the state
/// directory so a failed or finished upgrade can be diffed against it.
pub const SELECTIONS_FILE: &str = "selections.txt";
pub const MANUAL_FILE: &str = "manual-packages.txt";
pub const VERSIONS_FILE: &str = "versions.txt";

fn write_snapshot(
    paths: &SystemPaths,
    prefix: &str,
    pkg: &dyn PackageManager,
) -> Result<()> {
    let dir = paths.state_dir();
    io::ensure_dir(&dir)?;

    for (name, data) in [
        (SELECTIONS_FILE, pkg.selections()?),
        (MANUAL_FILE, pkg.manual_packages()?),
        (VERSIONS_FILE, pkg.installed_versions()?),
    ] {
        let path = dir.join(format!("{prefix}{name}"));
        io::atomic_write(&path, data.as_bytes())?;
        debug!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

/// Capture package selections, the manual-install list, installed versions,
/// and a verbatim copy of all source configuration, before any mutation.
pub fn capture_pre(paths: &SystemPaths, pkg: &dyn PackageManager) -> Result<()> {
    write_snapshot(paths, "", pkg)?;
    backup_sources(paths)?;
    info!("pre-upgrade package state snapshot complete");
    Ok(())
}

/// Capture the post-upgrade counterparts for diffing.
pub fn capture_post(paths: &SystemPaths, pkg: &dyn PackageManager) -> Result<()> {
    write_snapshot(paths, "post-", pkg)?;
    info!("post-upgrade package state snapshot complete");
    Ok(())
}

/// Copy the root source list and the parts directory into the state dir.
fn backup_sources(paths: &SystemPaths) -> Result<()> {
    let backup_dir = paths.sources_backup_dir();
    io::ensure_dir(&backup_dir)?;

    let root_list = paths.sources_list();
    if root_list.is_file() {
        std::fs::copy(&root_list, backup_dir.join("sources.list"))?;
    }
    let parts = paths.sources_parts();
    if parts.is_dir() {
        let parts_backup = backup_dir.join("sources.list.d");
        io::ensure_dir(&parts_backup)?;
        for entry in std::fs::read_dir(&parts)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() {
                std::fs::copy(&path, parts_backup.join(entry.file_name()))?;
            }
        }
    }
    Ok(())
}
