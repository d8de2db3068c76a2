use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use relup_core::options::{ConffilePolicy, RunOptions};
use relup_core::paths::SystemPaths;
use relup_core::{logging, runner};
use std::path::PathBuf;
use tracing::error;

const EXIT_INVALID_ARGS: i32 = 3;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Take the package maintainer's new configuration files.
    Replace,
    /// Keep the locally modified configuration files.
    Keep,
}

impl From<PolicyArg> for ConffilePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Replace => ConffilePolicy::Replace,
            PolicyArg::Keep => ConffilePolicy::Keep,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "relup",
    about = "Staged, resumable Debian bookworm -> trixie upgrade orchestrator",
    version
)]
struct Cli {
    /// Comma-separated critical services to verify after the upgrade
    #[arg(long, value_name = "LIST", default_value = "")]
    services: String,

    /// How to resolve configuration files changed by incoming packages
    #[arg(long, value_enum, value_name = "POLICY", default_value = "replace")]
    conffile_policy: PolicyArg,

    /// Do not report whether a reboot is required after the upgrade
    #[arg(long)]
    skip_reboot_check: bool,

    /// Delete all phase completion markers and exit
    #[arg(long)]
    reset: bool,

    /// Report what would be done without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Debug-level console output
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Log every external command line before it runs
    #[arg(long)]
    trace_commands: bool,

    /// Forward log records to the system log
    #[arg(long)]
    syslog: bool,

    /// Skip the confirmation pause before mutation begins
    #[arg(long, short = 'f')]
    force: bool,

    /// Filesystem prefix all well-known paths derive from
    #[arg(long, env = "RELUP_ROOT", default_value = "/", hide = true)]
    root: PathBuf,
}

impl Cli {
    fn into_options(self) -> relup_core::Result<RunOptions> {
        Ok(RunOptions {
            dry_run: self.dry_run,
            verbose: self.verbose,
            syslog: self.syslog,
            trace_commands: self.trace_commands,
            assume_yes: self.force,
            conffile_policy: self.conffile_policy.into(),
            skip_reboot_check: self.skip_reboot_check,
            reset: self.reset,
            services: RunOptions::parse_services(&self.services)?,
            root: self.root,
        })
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_INVALID_ARGS,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let options = match cli.into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let paths = SystemPaths::new(&options.root);
    let log_file = paths.log_file();
    let _log_guard = logging::init(&options, &log_file);

    let code = runner::run(options);
    if code != 0 && code != 6 {
        error!("upgrade did not complete; see {} for details", log_file.display());
    }
    std::process::exit(code);
}
