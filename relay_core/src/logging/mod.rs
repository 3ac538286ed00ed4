//! Logging for meshrelay.
//!
//! Structured logging is built on `tracing`. [`init_logging`] installs the
//! global subscriber; [`RecentLogs`] is an optional layer that keeps the most
//! recent events in memory for the management API.

mod recent;

pub use recent::{LogRecord, RecentLogs, DEFAULT_RECENT_CAPACITY};

use std::io;
use tracing::{Level, Subscriber};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, fmt::MakeWriter, prelude::*, registry::LookupSpan, EnvFilter, Layer};

/// Where console output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Console {
    #[default]
    Stdout,
    /// Keeps stdout free for command output
    Stderr,
    Off,
}

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Console destination (default: stdout)
    pub console: Console,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files, rotated daily (default: "meshrelay")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,

    /// In-memory capture served by the logs endpoint
    pub capture: Option<RecentLogs>,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            console: Console::Stdout,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "meshrelay".to_string(),
            json_format: false,
            include_file_line: false,
            capture: None,
        }
    }
}

impl LogOptions {
    /// Options at the level named in configuration ("trace".."error").
    pub fn from_level_name(name: &str) -> Self {
        LogOptions {
            level: parse_level(name),
            ..Default::default()
        }
    }

    pub fn with_capture(mut self, capture: RecentLogs) -> Self {
        self.capture = Some(capture);
        self
    }
}

/// Maps a level name to a [`Level`]; unknown names map to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Text or JSON formatting layer writing to `writer`.
fn formatted<S, W>(writer: W, options: &LogOptions, ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(options.include_file_line)
        .with_line_number(options.include_file_line)
        .with_target(true);

    if options.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed properly. Only the first call in a process
/// installs a subscriber.
///
/// # Examples
///
/// ```
/// use relay_core::logging::{init_logging, LogOptions, RecentLogs};
///
/// let recent = RecentLogs::new(100);
/// let _guard = init_logging(LogOptions::from_level_name("debug").with_capture(recent));
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` crate records into `tracing`
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let mut layers = Vec::new();
    let mut guard = None;

    match options.console {
        Console::Stdout => layers.push(formatted(io::stdout, &options, true)),
        Console::Stderr => layers.push(formatted(io::stderr, &options, true)),
        Console::Off => {}
    }

    if options.log_to_file {
        let appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);
        layers.push(formatted(writer, &options, false));
    }

    if let Some(capture) = options.capture {
        layers.push(capture.boxed());
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_from_level_name_keeps_defaults() {
        let options = LogOptions::from_level_name("trace");
        assert_eq!(options.level, Level::TRACE);
        assert_eq!(options.console, Console::Stdout);
        assert!(!options.log_to_file);
        assert!(options.capture.is_none());
    }
}
