use crate::error::Result;
use crate::exec::Runner;

/// Seam over the service manager; post-upgrade validation only ever asks one
/// question of it.
pub trait ServiceManager {
    fn is_active(&self, unit: &str) -> Result<bool>;
}

/// systemd implementation via `systemctl is-active`.
pub struct Systemctl {
    runner: Runner,
}

impl Systemctl {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }
}

impl ServiceManager for Systemctl {
    fn is_active(&self, unit: &str) -> Result<bool> {
        let (status, _) = self
            .runner
            .output_unchecked("systemctl", &["is-active", "--quiet", unit])?;
        Ok(status == 0)
    }
}
