//! Tracing setup
//!
//! Logs go to stderr; stdout is reserved for command output such as the pass
//! report JSON. With `logging.file` set, scheduler commands and `run-task`
//! workers append to separate rolling files next to the configured path.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Filter directives read before `RUST_LOG`, e.g. `batch_analysis::store=trace`
pub const LOG_FILTER_ENV: &str = "BATCH_LOG";

/// Which side of the system is logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// `schedule`, `daemon`, `tasks`, `experiment`
    Scheduler,
    /// `run-task` on a worker node
    Worker,
}

impl LogRole {
    fn tag(self) -> &'static str {
        match self {
            LogRole::Scheduler => "scheduler",
            LogRole::Worker => "worker",
        }
    }
}

/// Keeps the file writer flushing until dropped
pub struct LogGuards {
    _file: Option<WorkerGuard>,
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Install the global subscriber for a full command run
pub fn init_logging(settings: &LoggingSettings, role: LogRole, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = effective_level(settings, verbose, quiet);
    let filter = build_filter(level, env_directives().as_deref())?;

    let (file_output, guard) = match settings.file.as_deref() {
        Some(path) => {
            let (layer, guard) = file_layer(Path::new(path), role, settings)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer(settings.json_format))
        .with(file_output)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(level = %level, role = role.tag(), file = ?settings.file, "Logging initialized");
    Ok(LogGuards { _file: guard })
}

/// Stderr-only logging at a fixed level, for `config` subcommands
pub fn init_simple(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(level, env_directives().as_deref())?)
        .with(stderr_layer(false))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

/// `--quiet` wins, then `-v` counts, then the configured level
fn effective_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => settings.level.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn env_directives() -> Option<String> {
    std::env::var(LOG_FILTER_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .filter(|d| !d.trim().is_empty())
}

/// Directives from the environment replace the level entirely; otherwise the
/// level applies to this crate and dependencies stay at warn.
fn build_filter(level: Level, directives: Option<&str>) -> Result<EnvFilter> {
    let spec = match directives {
        Some(d) => d.to_string(),
        None => format!("warn,batch_analysis={}", level.as_str().to_lowercase()),
    };
    EnvFilter::try_new(&spec).map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", spec, e)))
}

fn stderr_layer<S>(json: bool) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    if json {
        Box::new(layer.json().with_current_span(true))
    } else {
        Box::new(layer.compact().with_ansi(std::io::stderr().is_terminal()))
    }
}

/// Directory and file prefix for a role: `logs/batch.log` becomes
/// `logs/batch-worker.<date>.log` for workers
fn role_file(path: &Path, role: LogRole) -> (PathBuf, String) {
    let directory = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("batch-analysis");
    (directory, format!("{}-{}", stem, role.tag()))
}

/// Rolling files rotate by time only; small size limits mean hourly files
fn rotation_for(max_file_size_mb: u64) -> Rotation {
    if max_file_size_mb > 0 && max_file_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    }
}

fn file_layer<S>(path: &Path, role: LogRole, settings: &LoggingSettings) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (directory, prefix) = role_file(path, role);
    std::fs::create_dir_all(&directory).map_err(|e| Error::IoWrite {
        path: directory.clone(),
        source: e,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(rotation_for(settings.max_file_size_mb))
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(settings.max_files.max(1) as usize)
        .build(&directory)
        .map_err(|e| Error::Config(format!("Failed to open log files in {}: {}", directory.display(), e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
    let layer: BoxedLayer<S> = if settings.json_format {
        Box::new(layer.json().with_current_span(true))
    } else {
        Box::new(layer.with_thread_ids(true))
    };
    Ok((layer, guard))
}
