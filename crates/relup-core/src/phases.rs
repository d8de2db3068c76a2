use crate::context::RunContext;
use crate::error::{Result, UpgradeError};
use crate::markers::MarkerStore as _;
use crate::options::ConffilePolicy;
use crate::pkg::PackageManager as _;
use crate::preflight;
use crate::release::{self, TARGET_RELEASE};
use crate::services::ServiceManager as _;
use crate::signal;
use crate::snapshot;
use crate::sources;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One marker-gated stage of the upgrade state machine. The order is fixed;
/// a phase never runs before its predecessors and is skipped only when its
/// marker is present or the operator resets the whole set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    Snapshot,
    UpdateCurrent,
    SwitchSources,
    MinimalUpgrade,
    FullUpgrade,
    Cleanup,
    Validate,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Preflight,
        Phase::Snapshot,
        Phase::UpdateCurrent,
        Phase::SwitchSources,
        Phase::MinimalUpgrade,
        Phase::FullUpgrade,
        Phase::Cleanup,
        Phase::Validate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Snapshot => "snapshot",
            Phase::UpdateCurrent => "update-current",
            Phase::SwitchSources => "switch-sources",
            Phase::MinimalUpgrade => "minimal-upgrade",
            Phase::FullUpgrade => "full-upgrade",
            Phase::Cleanup => "cleanup",
            Phase::Validate => "validate",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Phase::Preflight => "validate the environment before any mutation",
            Phase::Snapshot => "record package state and source configuration",
            Phase::UpdateCurrent => "bring the current release fully up to date",
            Phase::SwitchSources => "point package sources at the target release",
            Phase::MinimalUpgrade => "upgrade without any package removals",
            Phase::FullUpgrade => "complete the release upgrade",
            Phase::Cleanup => "purge leftovers and modernize source lists",
            Phase::Validate => "verify the upgraded system",
        }
    }

    /// Phases from here on mutate externally-visible package state.
    fn mutates_system(self) -> bool {
        matches!(
            self,
            Phase::UpdateCurrent
                | Phase::SwitchSources
                | Phase::MinimalUpgrade
                | Phase::FullUpgrade
                | Phase::Cleanup
        )
    }
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

/// Run one phase: skip when its marker is present, otherwise execute the body
/// from the start and persist the marker on success. Bodies are written to be
/// safe to re-run after a mid-phase interruption.
pub fn run_phase(ctx: &RunContext, phase: Phase) -> Result<()> {
    if ctx.markers.is_complete(phase.name()) {
        info!(phase = phase.name(), "already complete, skipping");
        return Ok(());
    }
    signal::check()?;
    info!(phase = phase.name(), "starting: {}", phase.describe());
    if phase.mutates_system() && !ctx.options.dry_run {
        ctx.note_mutation();
    }

    let result = match phase {
        Phase::Preflight => preflight::run_checks(ctx),
        Phase::Snapshot => run_snapshot(ctx),
        Phase::UpdateCurrent => run_update_current(ctx),
        Phase::SwitchSources => run_switch_sources(ctx),
        Phase::MinimalUpgrade => ctx.pkg.minimal_upgrade(ctx.options.conffile_policy),
        Phase::FullUpgrade => ctx.pkg.full_upgrade(ctx.options.conffile_policy),
        Phase::Cleanup => run_cleanup(ctx),
        Phase::Validate => run_validate(ctx),
    };

    if let Err(e) = result {
        // A command that died because we were signalled is an interruption,
        // not a command failure.
        signal::check()?;
        tracing::error!(phase = phase.name(), "phase failed: {e}");
        return Err(e);
    }

    ctx.markers.mark_complete(phase.name())?;
    info!(phase = phase.name(), "complete");
    Ok(())
}

/// Drive every phase in order. Re-invoking the program is the retry
/// mechanism: completed phases short-circuit on their markers.
pub fn run_sequence(ctx: &RunContext) -> Result<()> {
    for phase in Phase::ALL {
        run_phase(ctx, phase)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Phase bodies
// ---------------------------------------------------------------------------

fn run_snapshot(ctx: &RunContext) -> Result<()> {
    if ctx.options.dry_run {
        info!("dry-run: would snapshot package selections, versions and sources");
        return Ok(());
    }
    snapshot::capture_pre(&ctx.paths, ctx.pkg.as_ref())
}

/// Fully settle the current release before touching sources: refresh the
/// index, then upgrade and resolve-upgrade strictly within the release.
/// Conffiles keep their local versions here so nothing prompts.
fn run_update_current(ctx: &RunContext) -> Result<()> {
    ctx.pkg.update()?;
    ctx.pkg.upgrade(ConffilePolicy::Keep)?;
    ctx.pkg.full_upgrade(ConffilePolicy::Keep)
}

fn run_switch_sources(ctx: &RunContext) -> Result<()> {
    let outcome = {
        let mut registry = ctx.cleanup.borrow_mut();
        sources::switch_all(&ctx.paths, ctx.options.dry_run, &mut registry)?
    };
    if !outcome.third_party.is_empty() {
        warn!(
            "{} third-party source file(s) still reference the old release",
            outcome.third_party.len()
        );
    }
    // Re-validate against the rewritten sources; a failure here means they
    // are broken and must be investigated before retrying.
    ctx.pkg.update()
}

fn run_cleanup(ctx: &RunContext) -> Result<()> {
    ctx.pkg.autoremove_purge()?;
    ctx.pkg.clean_cache()?;
    modernize_sources(ctx);
    if ctx.options.dry_run {
        info!("dry-run: would snapshot post-upgrade package state");
        return Ok(());
    }
    snapshot::capture_post(&ctx.paths, ctx.pkg.as_ref())
}

/// Best-effort migration of source lists to the structured format. When the
/// tool is missing the package manager itself is upgraded first; if the
/// migration still fails it is a warning, never fatal.
fn modernize_sources(ctx: &RunContext) {
    if !ctx.pkg.can_modernize_sources() {
        info!("source modernization tool unavailable, upgrading the package manager first");
        if let Err(e) = ctx.pkg.upgrade_package("apt") {
            warn!("package manager self-upgrade failed, skipping source modernization: {e}");
            return;
        }
    }
    match ctx.pkg.modernize_sources() {
        Ok(()) => info!("source lists migrated to the structured format"),
        Err(e) => warn!("source list modernization failed (continuing): {e}"),
    }
}

fn run_validate(ctx: &RunContext) -> Result<()> {
    let mut issues = 0u32;

    if ctx.options.dry_run {
        info!("dry-run: skipping release identity assertion");
    } else {
        let os = release::OsRelease::load(&ctx.paths.os_release())?;
        if os.version_codename != TARGET_RELEASE {
            return Err(UpgradeError::ValidationFailed(format!(
                "running release is '{}', expected '{TARGET_RELEASE}'",
                os.version_codename
            )));
        }
        info!("release identity confirmed: {}", os.pretty_name);
    }

    match ctx.pkg.audit() {
        Ok(findings) if findings.is_empty() => info!("package database audit clean"),
        Ok(findings) => {
            for finding in &findings {
                warn!("audit: {finding}");
            }
            issues += findings.len() as u32;
        }
        Err(e) => {
            warn!("package database audit could not run: {e}");
            issues += 1;
        }
    }

    ctx.pkg.fix_broken()?;

    for unit in &ctx.options.services {
        match ctx.services.is_active(unit) {
            Ok(true) => info!("service {unit} is active"),
            Ok(false) => {
                warn!("critical service {unit} is not active");
                issues += 1;
            }
            Err(e) => {
                warn!("could not query service {unit}: {e}");
                issues += 1;
            }
        }
    }

    report_kernel(ctx);
    report_restart_advisories(ctx);

    if ctx.options.skip_reboot_check {
        debug!("reboot-required check suppressed");
    } else if ctx.paths.reboot_required().exists() {
        warn!("a reboot is required to finish the upgrade");
    } else {
        info!("no reboot-required marker present");
    }

    if issues > 0 {
        warn!("validation finished with {issues} advisory issue(s); see the log for details");
    } else {
        info!("validation finished with no issues");
    }
    Ok(())
}

fn report_kernel(ctx: &RunContext) {
    match ctx.runner().output("uname", &["-r"]) {
        Ok(version) => info!("running kernel: {}", version.trim()),
        Err(e) => warn!("could not determine kernel version: {e}"),
    }
}

/// Informational only: list services that still run pre-upgrade binaries,
/// when the advisory tool is installed.
fn report_restart_advisories(ctx: &RunContext) {
    if which::which("needrestart").is_err() {
        debug!("needrestart not installed, skipping restart advisory");
        return;
    }
    match ctx.runner().output_unchecked("needrestart", &["-b"]) {
        Ok((_, out)) => {
            for line in out.lines().filter(|l| !l.trim().is_empty()) {
                info!("needrestart: {line}");
            }
        }
        Err(e) => warn!("needrestart did not run: {e}"),
    }
}
