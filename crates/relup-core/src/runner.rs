use crate::context::RunContext;
use crate::error::{Result, UpgradeError};
use crate::lock::{LockFile, LOCK_TIMEOUT};
use crate::markers::MarkerStore as _;
use crate::options::RunOptions;
use crate::phases;
use crate::pkg::Apt;
use crate::release::{SOURCE_RELEASE, TARGET_RELEASE};
use crate::report::RunReport;
use crate::signal;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Top-level entry point: build the production context, drive the phase
/// sequence, and route every outcome (success, failure or signal) through
/// the one finalizer. Returns the process exit code.
pub fn run(options: RunOptions) -> i32 {
    let started_at = Utc::now();
    let ctx = RunContext::production(options);
    let result = execute(&ctx);
    finish(ctx, result, started_at)
}

fn execute(ctx: &RunContext) -> Result<()> {
    signal::install()?;

    let lock = LockFile::acquire(&ctx.paths.lock_file(), LOCK_TIMEOUT)?;
    ctx.cleanup
        .borrow_mut()
        .register("release instance lock", move || {
            let mut lock = lock;
            lock.release();
            Ok(())
        });

    if ctx.options.reset {
        ctx.markers.reset()?;
        info!("all phase markers removed; the next run starts from the beginning");
        return Ok(());
    }

    info!(
        "starting release upgrade {SOURCE_RELEASE} -> {TARGET_RELEASE}{}",
        if ctx.options.dry_run { " (dry-run)" } else { "" }
    );
    phases::run_sequence(ctx)?;
    info!("release upgrade to {TARGET_RELEASE} finished successfully");
    Ok(())
}

/// The unconditional finalizer. Decides the rollback path, drains the cleanup
/// registry exactly once, persists the status report, and hands back the
/// original (or signal-derived) exit code unchanged.
fn finish(ctx: RunContext, result: Result<()>, started_at: chrono::DateTime<Utc>) -> i32 {
    let (code, interrupted_by) = match &result {
        Ok(()) => (0, None),
        Err(UpgradeError::Interrupted { signal: sig, name }) => {
            warn!("run interrupted by {name}; cleaning up");
            (signal::exit_code(*sig), Some(name.to_string()))
        }
        Err(e) if e.is_noop_exit() => {
            info!("{e}");
            (e.exit_code(), None)
        }
        Err(e) => {
            error!("upgrade failed: {e}");
            debug!("run configuration at failure: {:?}", ctx.options);
            (e.exit_code(), None)
        }
    };

    // The no-op early exit mutated nothing: discard path, not rollback.
    let failed = code != 0 && !matches!(&result, Err(e) if e.is_noop_exit());

    let recovery_hook: Option<Box<dyn Fn()>> =
        if failed && ctx.mutation_started() && !ctx.options.dry_run {
            let apt = Apt::new(ctx.runner(), ctx.paths.package_locks());
            Some(Box::new(move || apt.recover_database()))
        } else {
            None
        };

    ctx.cleanup
        .borrow_mut()
        .finalize(failed, recovery_hook.as_deref());

    if !ctx.options.dry_run {
        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            exit_code: code,
            interrupted_by,
            phases_completed: ctx.markers.completed(),
            dry_run: ctx.options.dry_run,
        };
        if let Err(e) = report.save(&ctx.paths.state_dir()) {
            debug!("could not write run report: {e}");
        }
    }

    code
}
