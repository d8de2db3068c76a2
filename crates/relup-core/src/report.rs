use crate::error::Result;
use crate::io;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const REPORT_FILE: &str = "last-run.yaml";

/// Final status record of one run, written into the state directory so the
/// outcome survives the process and a failed run can be audited later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    /// Name of the signal that ended the run, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted_by: Option<String>,
    pub phases_completed: Vec<String>,
    pub dry_run: bool,
}

impl RunReport {
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&state_dir.join(REPORT_FILE), data.as_bytes())
    }
}
