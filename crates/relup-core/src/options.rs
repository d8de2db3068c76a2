use crate::error::{Result, UpgradeError};
use std::path::PathBuf;

/// Environment variable that enables full command tracing independent of
/// `--trace-commands`.
pub const TRACE_ENV: &str = "RELUP_TRACE";

// ---------------------------------------------------------------------------
// ConffilePolicy
// ---------------------------------------------------------------------------

/// How dpkg resolves a configuration file that differs between the installed
/// and the incoming package version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConffilePolicy {
    /// Take the maintainer's new version (`--force-confnew`).
    #[default]
    Replace,
    /// Keep the locally installed version (`--force-confold`).
    Keep,
}

impl ConffilePolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "replace" => Ok(ConffilePolicy::Replace),
            "keep" => Ok(ConffilePolicy::Keep),
            other => Err(UpgradeError::InvalidArguments(format!(
                "invalid conffile policy '{other}' (expected 'replace' or 'keep')"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConffilePolicy::Replace => "replace",
            ConffilePolicy::Keep => "keep",
        }
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Immutable run configuration, built once from the command line.
///
/// Nothing in here changes after construction; every component receives a
/// shared reference rather than consulting globals.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Report what would be done without mutating anything.
    pub dry_run: bool,
    /// Console logging at debug level.
    pub verbose: bool,
    /// Forward log records to the system log.
    pub syslog: bool,
    /// Log every external command line before running it.
    pub trace_commands: bool,
    /// Skip the pre-upgrade confirmation pause.
    pub assume_yes: bool,
    /// Conffile conflict resolution for the upgrade phases.
    pub conffile_policy: ConffilePolicy,
    /// Suppress the reboot-required report in post-upgrade validation.
    pub skip_reboot_check: bool,
    /// Delete all phase markers and exit without running any phase.
    pub reset: bool,
    /// Critical services that must be active after the upgrade.
    pub services: Vec<String>,
    /// Filesystem prefix all well-known paths derive from. `/` in production;
    /// overridable so tests can run against a scratch tree.
    pub root: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verbose: false,
            syslog: false,
            trace_commands: false,
            assume_yes: false,
            conffile_policy: ConffilePolicy::default(),
            skip_reboot_check: false,
            reset: false,
            services: Vec::new(),
            root: PathBuf::from("/"),
        }
    }
}

impl RunOptions {
    /// Split and validate a comma-separated service list. Empty segments are
    /// rejected rather than silently dropped so typos surface early.
    pub fn parse_services(list: &str) -> Result<Vec<String>> {
        if list.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut services = Vec::new();
        for name in list.split(',') {
            let name = name.trim();
            if name.is_empty() {
                return Err(UpgradeError::InvalidArguments(format!(
                    "empty entry in service list '{list}'"
                )));
            }
            services.push(name.to_string());
        }
        Ok(services)
    }

    /// Command tracing is on when either the flag or the environment asks.
    pub fn trace_enabled(&self) -> bool {
        if self.trace_commands {
            return true;
        }
        std::env::var(TRACE_ENV).map(|v| v == "1").unwrap_or(false)
    }
}
