use crate::error::{Result, UpgradeError};
use signal_hook::consts::signal::{
    SIGABRT, SIGBUS, SIGHUP, SIGINT, SIGQUIT, SIGSYS, SIGTERM, SIGTRAP,
};
use signal_hook::low_level;
use std::sync::atomic::{AtomicI32, Ordering};

/// Signals that request an orderly shutdown.
pub const GRACEFUL: &[i32] = &[SIGHUP, SIGINT, SIGQUIT, SIGTERM];

/// Program-fault signals we can still hook from userspace. SIGILL, SIGFPE and
/// SIGSEGV cannot be intercepted safely from Rust and keep their OS default.
pub const FAULT: &[i32] = &[SIGTRAP, SIGABRT, SIGBUS, SIGSYS];

/// First received signal, or 0. Written once; later signals are ignored so
/// handling is not re-entrant.
static RECEIVED: AtomicI32 = AtomicI32::new(0);

fn latch(sig: i32) -> bool {
    latch_into(&RECEIVED, sig)
}

fn latch_into(cell: &AtomicI32, sig: i32) -> bool {
    cell.compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Install handlers for graceful-termination and fault signals.
///
/// Graceful signals only latch; the run loop polls [`check`] at step
/// boundaries and converts the latch into the interrupted error, which routes
/// through the normal finalizer. Fault signals latch and then leave the
/// process immediately with the signal-derived code; after a program fault
/// there is no stack to safely unwind through.
pub fn install() -> Result<()> {
    for &sig in GRACEFUL {
        // Safety: the handler only performs an atomic store.
        unsafe {
            low_level::register(sig, move || {
                latch(sig);
            })
        }
        .map_err(UpgradeError::Io)?;
    }
    for &sig in FAULT {
        // Safety: atomic store plus _exit, both async-signal-safe.
        unsafe {
            low_level::register(sig, move || {
                latch(sig);
                low_level::exit(exit_code(sig));
            })
        }
        .map_err(UpgradeError::Io)?;
    }
    Ok(())
}

/// The latched signal, if any.
pub fn received() -> Option<i32> {
    match RECEIVED.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

/// Error out if a termination signal has been received. Called between steps
/// so a pending signal turns into the abnormal-termination pathway.
pub fn check() -> Result<()> {
    match received() {
        Some(sig) => Err(UpgradeError::Interrupted {
            signal: sig,
            name: name(sig),
        }),
        None => Ok(()),
    }
}

pub fn exit_code(sig: i32) -> i32 {
    128 + sig
}

pub fn name(sig: i32) -> &'static str {
    match sig {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGQUIT => "SIGQUIT",
        SIGTERM => "SIGTERM",
        SIGTRAP => "SIGTRAP",
        SIGABRT => "SIGABRT",
        SIGBUS => "SIGBUS",
        SIGSYS => "SIGSYS",
        _ => "unknown signal",
    }
}
