use crate::io;
use crate::options::RunOptions;
use std::fs::{File, OpenOptions};
use std::os::unix::net::UnixDatagram;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::Metadata;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const SYSLOG_SOCKET: &str = "/dev/log";
/// RFC 3164 "user" facility.
const SYSLOG_FACILITY: u8 = 1;

/// Keeps the non-blocking log-file worker alive for the duration of the run.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the logging stack: colored leveled console output, mirrored into
/// the persistent log file at debug level, optionally forwarded to the
/// system log. A log file that cannot be opened degrades to console-only
/// rather than aborting the run.
pub fn init(options: &RunOptions, log_path: &Path) -> LogGuard {
    let console_level = if options.trace_enabled() {
        "trace"
    } else if options.verbose {
        "debug"
    } else {
        "info"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(console_filter);

    let mut file_guard = None;
    let file_layer = open_log_file(log_path).map(|file| {
        let (writer, guard) = tracing_appender::non_blocking(file);
        file_guard = Some(guard);
        let file_level = if options.trace_enabled() {
            LevelFilter::TRACE
        } else {
            LevelFilter::DEBUG
        };
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(file_level)
    });
    if file_layer.is_none() {
        eprintln!(
            "warning: could not open log file {}, logging to console only",
            log_path.display()
        );
    }

    let syslog_layer = if options.syslog {
        match SyslogMakeWriter::connect() {
            Some(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .without_time()
                    .with_level(false)
                    .with_writer(writer)
                    .with_filter(LevelFilter::INFO),
            ),
            None => {
                eprintln!("warning: could not connect to {SYSLOG_SOCKET}, syslog forwarding off");
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(syslog_layer)
        .try_init();

    LogGuard { _file: file_guard }
}

fn open_log_file(path: &Path) -> Option<File> {
    let parent = path.parent()?;
    io::ensure_dir(parent).ok()?;
    OpenOptions::new().create(true).append(true).open(path).ok()
}

// ---------------------------------------------------------------------------
// Syslog forwarding
// ---------------------------------------------------------------------------

/// Minimal RFC 3164 forwarder over the local datagram socket. Each formatted
/// log line becomes one syslog message with the severity mapped from the
/// tracing level.
struct SyslogMakeWriter {
    socket: Arc<UnixDatagram>,
    ident: String,
}

impl SyslogMakeWriter {
    fn connect() -> Option<Self> {
        let socket = UnixDatagram::unbound().ok()?;
        socket.connect(SYSLOG_SOCKET).ok()?;
        Some(Self {
            socket: Arc::new(socket),
            ident: format!("relup[{}]", std::process::id()),
        })
    }

    fn writer(&self, severity: u8) -> SyslogWriter {
        SyslogWriter {
            socket: Arc::clone(&self.socket),
            header: format!("<{}>{}: ", (SYSLOG_FACILITY << 3) | severity, self.ident),
            buf: Vec::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(5)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let severity = match *meta.level() {
            tracing::Level::ERROR => 3,
            tracing::Level::WARN => 4,
            tracing::Level::INFO => 6,
            _ => 7,
        };
        self.writer(severity)
    }
}

struct SyslogWriter {
    socket: Arc<UnixDatagram>,
    header: String,
    buf: Vec<u8>,
}

impl std::io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&self.buf);
        let message = message.trim_end();
        if !message.is_empty() {
            let mut datagram = self.header.clone().into_bytes();
            datagram.extend_from_slice(message.as_bytes());
            // Forwarding is best-effort; the console and file still have it.
            let _ = self.socket.send(&datagram);
        }
        self.buf.clear();
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn log_file_opens_in_append_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("var/log/relup.log");

        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "first").unwrap();
        drop(file);
        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "second").unwrap();
        drop(file);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn unwritable_log_path_degrades_to_none() {
        assert!(open_log_file(Path::new("/proc/relup-no-such/relup.log")).is_none());
    }

    #[test]
    fn syslog_priority_encodes_facility_and_severity() {
        let socket = UnixDatagram::unbound().unwrap();
        let make = SyslogMakeWriter {
            socket: Arc::new(socket),
            ident: "relup[1]".to_string(),
        };
        // user facility (1) << 3 | err (3) = 11
        assert!(make.writer(3).header.starts_with("<11>relup[1]: "));
        // user facility (1) << 3 | info (6) = 14
        assert!(make.writer(6).header.starts_with("<14>relup[1]: "));
    }
}
