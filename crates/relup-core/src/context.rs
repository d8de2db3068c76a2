use crate::cleanup::{ChildTracker, CleanupRegistry};
use crate::exec::Runner;
use crate::markers::{FsMarkerStore, MarkerStore};
use crate::net::{NetProbe, SystemNet};
use crate::options::RunOptions;
use crate::paths::SystemPaths;
use crate::pkg::{Apt, PackageManager};
use crate::services::{ServiceManager, Systemctl};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Everything a phase needs, built once at startup and threaded through the
/// whole run. The options are frozen; the collaborators are trait objects so
/// tests can wire in fakes.
pub struct RunContext {
    pub options: RunOptions,
    pub paths: SystemPaths,
    pub markers: Box<dyn MarkerStore>,
    pub pkg: Box<dyn PackageManager>,
    pub services: Box<dyn ServiceManager>,
    pub net: Box<dyn NetProbe>,
    pub cleanup: RefCell<CleanupRegistry>,
    pub children: Arc<ChildTracker>,
    mutation_started: Cell<bool>,
}

impl RunContext {
    /// Production wiring: apt/dpkg, systemctl, the system resolver, and
    /// durable markers under the state directory.
    pub fn production(options: RunOptions) -> Self {
        let paths = SystemPaths::new(&options.root);
        let children = ChildTracker::new();
        let runner = Runner::new(
            options.dry_run,
            options.trace_enabled(),
            Arc::clone(&children),
        );
        let service_runner = Runner::new(
            options.dry_run,
            options.trace_enabled(),
            Arc::clone(&children),
        );
        Self {
            markers: Box::new(FsMarkerStore::new(paths.markers_dir(), options.dry_run)),
            pkg: Box::new(Apt::new(runner, paths.package_locks())),
            services: Box::new(Systemctl::new(service_runner)),
            net: Box::new(SystemNet),
            cleanup: RefCell::new(CleanupRegistry::new(Arc::clone(&children))),
            children,
            paths,
            options,
            mutation_started: Cell::new(false),
        }
    }

    /// A fresh command runner sharing this run's child tracker.
    pub fn runner(&self) -> Runner {
        Runner::new(
            self.options.dry_run,
            self.options.trace_enabled(),
            Arc::clone(&self.children),
        )
    }

    /// Record that a phase with externally-visible package mutations has
    /// begun; the finalizer only attempts package-database recovery after
    /// this point.
    pub fn note_mutation(&self) {
        self.mutation_started.set(true);
    }

    pub fn mutation_started(&self) -> bool {
        self.mutation_started.get()
    }
}
