//! Logging setup: tracing to stderr plus a daily rolling log file.
//!
//! Log files live in `<data_dir>/agent-assist/logs/agent-assist.YYYY-MM-DD.log`;
//! the appender keeps the newest seven.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_PREFIX: &str = "agent-assist";
const LOG_SUFFIX: &str = "log";
const KEEP_FILES: usize = 7;

/// How chatty the terminal should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (_, true) => Verbosity::Verbose,
            (true, false) => Verbosity::Quiet,
            _ => Verbosity::Normal,
        }
    }

    fn default_directive(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

/// Keeps the background log writer alive; buffered lines are flushed on drop.
pub struct LogGuard {
    log_dir: PathBuf,
    _worker: WorkerGuard,
}

impl LogGuard {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Default log directory under the platform data dir
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("agent-assist").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Initialize tracing. Returns a guard when file logging is active; hold it
/// until the process is done logging.
///
/// `RUST_LOG` overrides the verbosity-derived filter.
pub fn init_logging(verbosity: Verbosity) -> Option<LogGuard> {
    init_logging_in(&default_log_dir(), verbosity)
}

pub fn init_logging_in(log_dir: &Path, verbosity: Verbosity) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()));

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match file_writer(log_dir) {
        Some((writer, worker)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(LogGuard { log_dir: log_dir.to_path_buf(), _worker: worker }),
        ),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed { guard } else { None }
}

fn file_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(KEEP_FILES)
        .build(log_dir)
        .map_err(|e| eprintln!("File logging disabled: {}", e))
        .ok()?;
    Some(tracing_appender::non_blocking(appender))
}
