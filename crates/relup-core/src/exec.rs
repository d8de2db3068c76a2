use crate::cleanup::ChildTracker;
use crate::error::{Result, UpgradeError};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// All external commands go through this runner so dry-run, command tracing,
/// child tracking and output mirroring behave the same everywhere.
///
/// Mutating commands respect dry-run; read-only queries always execute.
pub struct Runner {
    dry_run: bool,
    trace: bool,
    children: Arc<ChildTracker>,
}

impl Runner {
    pub fn new(dry_run: bool, trace: bool, children: Arc<ChildTracker>) -> Self {
        Self {
            dry_run,
            trace,
            children,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn render(program: &str, args: &[&str]) -> String {
        let mut cmd = String::from(program);
        for arg in args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("DEBIAN_FRONTEND", "noninteractive");
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a mutating command. Under dry-run the command line is reported and
    /// nothing executes. Output is mirrored line by line into the log.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let rendered = Self::render(program, args);
        if self.dry_run {
            info!("dry-run: would run: {rendered}");
            return Ok(());
        }
        if self.trace {
            info!("+ {rendered}");
        } else {
            debug!("running: {rendered}");
        }

        let mut child = self
            .command(program, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id() as i32;
        self.children.register(pid);

        let stdout = child.stdout.take().map(|s| mirror_stream(s, false));
        let stderr = child.stderr.take().map(|s| mirror_stream(s, true));

        let status = child.wait();
        if let Some(handle) = stdout {
            let _ = handle.join();
        }
        if let Some(handle) = stderr {
            let _ = handle.join();
        }
        self.children.unregister(pid);

        let status = status?;
        if !status.success() {
            return Err(UpgradeError::CommandFailed {
                command: rendered,
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Run a read-only query and return its stdout. Executes even under
    /// dry-run. A non-zero exit is an error.
    pub fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        let (status, stdout) = self.output_unchecked(program, args)?;
        if status != 0 {
            return Err(UpgradeError::CommandFailed {
                command: Self::render(program, args),
                status,
            });
        }
        Ok(stdout)
    }

    /// Like [`output`], but a non-zero exit is part of the answer rather than
    /// an error. Used for probes whose exit status carries meaning.
    ///
    /// [`output`]: Runner::output
    pub fn output_unchecked(&self, program: &str, args: &[&str]) -> Result<(i32, String)> {
        let rendered = Self::render(program, args);
        if self.trace {
            info!("+ {rendered}");
        } else {
            debug!("querying: {rendered}");
        }

        let child = self
            .command(program, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id() as i32;
        self.children.register(pid);
        let output = child.wait_with_output();
        self.children.unregister(pid);
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("{program} stderr: {}", stderr.trim());
        }
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

/// Mirror a child stream into the log, line by line, so the persistent log
/// captures the full package-manager transcript.
fn mirror_stream<R: Read + Send + 'static>(
    stream: R,
    is_stderr: bool,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            if is_stderr {
                warn!("  {line}");
            } else {
                info!("  {line}");
            }
        }
    })
}
