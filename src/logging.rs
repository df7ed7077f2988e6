//! Logging configuration and initialization.
//!
//! This module sets up the tracing subscriber based on the application
//! configuration, supporting stdout, stderr, and file output with
//! configurable formats.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from CLI/environment
/// * `trace_deps` - If true, include verbose logging from dependencies
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override
        .as_ref()
        .unwrap_or(&config.level)
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&level, trace_deps)));

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stdout());
            (BoxMakeWriter::new(non_blocking), guard)
        }
        "stderr" => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stderr());
            (BoxMakeWriter::new(non_blocking), guard)
        }
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            (BoxMakeWriter::new(non_blocking), guard)
        }
    };

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
    }

    Ok(guard)
}

/// Builds the default filter, quieting the HTTP stack unless `trace_deps`.
fn filter_directives(level: &str, trace_deps: bool) -> String {
    let level = parse_level(level).to_string().to_lowercase();
    if trace_deps {
        level
    } else {
        format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn")
    }
}

/// Parses a log level string to a tracing Level.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
