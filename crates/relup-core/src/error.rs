use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpgradeError>;

/// Every failure class the orchestrator can report, with a stable exit code.
///
/// `AlreadyUpgraded` is deliberately a distinct non-zero code rather than
/// success: callers branch on "nothing to do" separately from "upgraded".
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not acquire lock on {path} within {timeout_secs}s; another instance may be running or stuck")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("this program must be run as root")]
    NotRoot,

    #[error("unexpected current release '{found}' (expected '{expected}')")]
    UnexpectedRelease { found: String, expected: String },

    #[error("system is already running the target release '{0}'")]
    AlreadyUpgraded(String),

    #[error("DNS resolution failed for {host}: {detail}")]
    DnsFailure { host: String, detail: String },

    #[error("HTTPS endpoint unreachable: {url}: {detail}")]
    HttpsUnreachable { url: String, detail: String },

    #[error("insufficient disk space on {mount}: {available_mib} MiB available, {required_mib} MiB required")]
    DiskSpace {
        mount: PathBuf,
        available_mib: u64,
        required_mib: u64,
    },

    #[error("post-upgrade validation failed: {0}")]
    ValidationFailed(String),

    #[error("terminated by {name} (signal {signal})")]
    Interrupted { signal: i32, name: &'static str },

    #[error("command failed: {command} (exit status {status})")]
    CommandFailed { command: String, status: i32 },

    #[error("required commands not found: {}", .0.join(", "))]
    MissingCommands(Vec<String>),

    #[error("no package source file references the current release; refusing to continue")]
    NoSourcesRewritten,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

impl UpgradeError {
    /// Stable process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::LockTimeout { .. } => 2,
            UpgradeError::InvalidArguments(_) => 3,
            UpgradeError::NotRoot => 4,
            UpgradeError::UnexpectedRelease { .. } => 5,
            UpgradeError::AlreadyUpgraded(_) => 6,
            UpgradeError::DnsFailure { .. } | UpgradeError::HttpsUnreachable { .. } => 7,
            UpgradeError::DiskSpace { .. } => 8,
            UpgradeError::ValidationFailed(_) => 9,
            UpgradeError::Interrupted { signal, .. } => 128 + signal,
            _ => 1,
        }
    }

    /// True for the "nothing to do" early exit, which must not trigger the
    /// failure rollback path even though its exit code is non-zero.
    pub fn is_noop_exit(&self) -> bool {
        matches!(self, UpgradeError::AlreadyUpgraded(_))
    }
}
