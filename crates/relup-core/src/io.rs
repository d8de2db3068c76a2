use crate::error::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting state files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Infix used for sibling backup copies of modified files.
pub const BACKUP_INFIX: &str = ".bak.";

/// Sibling backup name for `path`: `<name>.bak.<random>`. The random suffix
/// keeps backups from successive runs from clobbering each other.
pub fn backup_path(path: &Path) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(BACKUP_INFIX);
    name.push(&suffix);
    path.with_file_name(name)
}

/// Whether `path` looks like a backup artifact produced by [`backup_path`].
pub fn is_backup_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(BACKUP_INFIX))
        .unwrap_or(false)
}
