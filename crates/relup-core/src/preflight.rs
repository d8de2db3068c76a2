use crate::context::RunContext;
use crate::error::{Result, UpgradeError};
use crate::net::{NetProbe, REQUIRED_HOSTS};
use crate::options::RunOptions;
use crate::pkg::PackageManager as _;
use crate::release;
use crate::signal;
use crate::sources;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::statvfs::statvfs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Minimum free space on the root filesystem before an upgrade may start.
pub const MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Recommended floor for the open-file-descriptor soft limit.
pub const MIN_NOFILE: u64 = 1024;

/// Every external command the rest of the run depends on.
pub const REQUIRED_COMMANDS: &[&str] = &[
    "apt-get",
    "apt-mark",
    "apt",
    "dpkg",
    "dpkg-query",
    "systemctl",
    "uname",
];

/// Length of the last-chance warning pause before mutation begins.
pub const CONFIRM_PAUSE: Duration = Duration::from_secs(10);

/// The full preflight battery. Checks are independent of each other; each is
/// fatal on failure except where noted.
pub fn run_checks(ctx: &RunContext) -> Result<()> {
    check_privilege()?;

    let os = release::require_source(&ctx.paths.os_release())?;
    info!(
        "release check ok: {} ({} -> {})",
        os.pretty_name,
        release::SOURCE_RELEASE,
        release::TARGET_RELEASE
    );

    check_disk_space(ctx.paths.root(), MIN_FREE_BYTES)?;
    check_fd_limit();
    warn_held_packages(ctx);
    check_commands(REQUIRED_COMMANDS)?;
    check_network(ctx.net.as_ref())?;
    report_third_party_sources(ctx)?;
    confirmation_pause(&ctx.options)
}

fn check_privilege() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(UpgradeError::NotRoot);
    }
    Ok(())
}

pub(crate) fn check_disk_space(mount: &Path, required: u64) -> Result<()> {
    let stat = statvfs(mount).map_err(|e| UpgradeError::Io(e.into()))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < required {
        return Err(UpgradeError::DiskSpace {
            mount: mount.to_path_buf(),
            available_mib: available / (1024 * 1024),
            required_mib: required / (1024 * 1024),
        });
    }
    info!(
        "disk space ok: {} MiB available on {}",
        available / (1024 * 1024),
        mount.display()
    );
    Ok(())
}

/// Advisory only: a low descriptor ceiling slows large package operations but
/// does not make them unsafe.
fn check_fd_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) if soft < MIN_NOFILE => {
            warn!("open-file limit {soft} is below the recommended {MIN_NOFILE}");
        }
        Ok((soft, _)) => info!("open-file limit ok ({soft})"),
        Err(e) => warn!("could not read open-file limit: {e}"),
    }
}

/// Advisory only: held packages can pin dependency resolution mid-upgrade,
/// but unholding is the operator's call, never ours.
fn warn_held_packages(ctx: &RunContext) {
    match ctx.pkg.held_packages() {
        Ok(held) if held.is_empty() => info!("no packages on hold"),
        Ok(held) => {
            warn!(
                "{} package(s) held at a fixed version: {}",
                held.len(),
                held.join(", ")
            );
        }
        Err(e) => warn!("could not query held packages: {e}"),
    }
}

pub(crate) fn check_commands(commands: &[&str]) -> Result<()> {
    let missing: Vec<String> = commands
        .iter()
        .filter(|c| which::which(c).is_err())
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(UpgradeError::MissingCommands(missing));
    }
    info!("all required commands resolvable");
    Ok(())
}

fn check_network(net: &dyn NetProbe) -> Result<()> {
    for host in REQUIRED_HOSTS {
        net.resolve(host)?;
        net.https_reachable(host)?;
    }
    info!("network ok: all upstream hosts resolvable and reachable");
    Ok(())
}

/// Third-party sources are never modified by the switch phase; surfacing them
/// up front lets the operator deal with them before anything changes.
fn report_third_party_sources(ctx: &RunContext) -> Result<()> {
    let files = sources::scan(&ctx.paths)?;
    let mut found = 0;
    for file in &files {
        if sources::mentions(&file.content, release::SOURCE_RELEASE)
            && !sources::is_distro_operated(file)
        {
            warn!(
                path = %file.path.display(),
                "third-party package source detected; it will not be rewritten"
            );
            found += 1;
        }
    }
    if found == 0 {
        info!("no third-party package sources reference the current release");
    }
    Ok(())
}

/// Fixed-duration countdown giving the operator a last chance to cancel.
/// Skipped with `--force` and under dry-run. An interrupt during the pause is
/// honored immediately.
fn confirmation_pause(options: &RunOptions) -> Result<()> {
    if options.assume_yes || options.dry_run {
        return Ok(());
    }
    warn!(
        "about to upgrade this system from {} to {}; this cannot be interrupted safely once \
         package operations begin",
        release::SOURCE_RELEASE,
        release::TARGET_RELEASE
    );
    let secs = CONFIRM_PAUSE.as_secs();
    for remaining in (1..=secs).rev() {
        signal::check()?;
        warn!("starting in {remaining}s, press Ctrl-C to abort");
        std::thread::sleep(Duration::from_secs(1));
    }
    signal::check()?;
    info!("proceeding with the upgrade");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_check_passes_with_zero_requirement() {
        check_disk_space(Path::new("/"), 0).unwrap();
    }

    #[test]
    fn disk_check_fails_with_impossible_requirement() {
        let err = check_disk_space(Path::new("/"), u64::MAX).unwrap_err();
        assert_eq!(err.exit_code(), 8);
    }

    #[test]
    fn missing_commands_are_reported_together() {
        let err =
            check_commands(&["sh", "relup-test-missing-a", "relup-test-missing-b"]).unwrap_err();
        match err {
            UpgradeError::MissingCommands(missing) => {
                assert_eq!(
                    missing,
                    vec!["relup-test-missing-a", "relup-test-missing-b"]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn present_commands_pass() {
        check_commands(&["sh"]).unwrap();
    }

    #[test]
    fn network_check_fails_on_first_unresolvable_host() {
        use crate::net::testing::FakeNet;
        let mut net = FakeNet::default();
        net.unresolvable.insert("deb.debian.org".to_string());
        let err = check_network(&net).unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn network_check_fails_on_unreachable_https() {
        use crate::net::testing::FakeNet;
        let mut net = FakeNet::default();
        net.unreachable.insert("security.debian.org".to_string());
        let err = check_network(&net).unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn pause_is_skipped_under_force_and_dry_run() {
        let mut options = RunOptions {
            assume_yes: true,
            ..RunOptions::default()
        };
        confirmation_pause(&options).unwrap();

        options.assume_yes = false;
        options.dry_run = true;
        confirmation_pause(&options).unwrap();
    }
}
