use crate::error::{Result, UpgradeError};
use std::path::Path;

/// The release this tool upgrades from.
pub const SOURCE_RELEASE: &str = "bookworm";
/// The release this tool upgrades to.
pub const TARGET_RELEASE: &str = "trixie";

// ---------------------------------------------------------------------------
// OsRelease
// ---------------------------------------------------------------------------

/// The fields of `/etc/os-release` the orchestrator cares about.
#[derive(Debug, Clone, Default)]
pub struct OsRelease {
    pub id: String,
    pub version_codename: String,
    pub pretty_name: String,
}

impl OsRelease {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse os-release key=value syntax. Values may be quoted; comments and
    /// unknown keys are ignored.
    pub fn parse(content: &str) -> Self {
        let mut release = OsRelease::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "ID" => release.id = value.to_string(),
                "VERSION_CODENAME" => release.version_codename = value.to_string(),
                "PRETTY_NAME" => release.pretty_name = value.to_string(),
                _ => {}
            }
        }
        release
    }
}

// ---------------------------------------------------------------------------
// Standing
// ---------------------------------------------------------------------------

/// Where the running system stands relative to the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Standing {
    /// At the expected source release; the upgrade may proceed.
    AtSource,
    /// Already at the target release; nothing to do.
    AtTarget,
    /// Neither source nor target; refuse to touch the system.
    Unexpected(String),
}

pub fn standing(release: &OsRelease) -> Standing {
    match release.version_codename.as_str() {
        SOURCE_RELEASE => Standing::AtSource,
        TARGET_RELEASE => Standing::AtTarget,
        other => Standing::Unexpected(other.to_string()),
    }
}

/// Load the release identity and fail unless the system is at the source
/// release. "Already at target" is the dedicated no-op exit, not an error.
pub fn require_source(path: &Path) -> Result<OsRelease> {
    let release = OsRelease::load(path).map_err(|_| UpgradeError::UnexpectedRelease {
        found: "unknown (os-release unreadable)".to_string(),
        expected: SOURCE_RELEASE.to_string(),
    })?;
    match standing(&release) {
        Standing::AtSource => Ok(release),
        Standing::AtTarget => Err(UpgradeError::AlreadyUpgraded(TARGET_RELEASE.to_string())),
        Standing::Unexpected(found) => Err(UpgradeError::UnexpectedRelease {
            found,
            expected: SOURCE_RELEASE.to_string(),
        }),
    }
}
