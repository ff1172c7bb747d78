//! Logging setup on tracing + tracing-subscriber
//!
//! Console output always; an optional rolling log file through a
//! non-blocking writer. `RUST_LOG` refines the filter per module.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Dependencies that are noisy below `warn`
const QUIET_TARGETS: &[&str] = &["hyper", "reqwest", "h2", "rustls"];

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Keeps the file writer alive; dropping it flushes buffered lines
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the global subscriber.
///
/// Keep the returned guards alive until the program exits.
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);
    let filter = build_env_filter(level)?;

    let console = fmt_layer(BoxMakeWriter::new(std::io::stderr), settings.json_format, true);

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(path) => {
            let (writer, guard) = rolling_writer(Path::new(path), settings)?;
            let layer = fmt_layer(BoxMakeWriter::new(writer), settings.json_format, false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(
        level = %level,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// Effective level from settings and CLI flags
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn directive(raw: &str) -> Result<Directive> {
    raw.parse()
        .map_err(|e| Error::config_field_invalid("logging.level", format!("Bad log directive '{}': {}", raw, e)))
}

/// `RUST_LOG` if set, else the effective level; our own crate always
/// logs at the effective level and noisy dependencies are capped at warn
fn build_env_filter(level: Level) -> Result<EnvFilter> {
    let base = level.to_string().to_lowercase();
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));

    filter = filter.add_directive(directive(&format!("otter_node={}", base))?);
    for target in QUIET_TARGETS {
        filter = filter.add_directive(directive(&format!("{}=warn", target))?);
    }
    Ok(filter)
}

/// One formatting layer over any writer
fn fmt_layer<S>(writer: BoxMakeWriter, json: bool, console: bool) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .boxed()
    } else if console {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(true)
            .compact()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .boxed()
    }
}

/// Split a log path into the appender's directory and file prefix
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("otter-node")
        .to_string();
    (directory, prefix)
}

/// tracing-appender rotates by time only; small size budgets rotate hourly
fn rotation_for(max_file_size_mb: u64) -> Rotation {
    if max_file_size_mb > 0 && max_file_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    }
}

fn rolling_writer(
    path: &Path,
    settings: &LoggingSettings,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let (directory, prefix) = split_log_path(path);
    fs::create_dir_all(&directory).map_err(|e| Error::IoWrite {
        path: directory.clone(),
        source: e,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(rotation_for(settings.max_file_size_mb))
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(settings.max_files.max(1) as usize)
        .build(&directory)
        .map_err(|e| Error::Internal(format!("Failed to create log file appender: {}", e)))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Compact console logging at a fixed level, for tests and tools
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}
