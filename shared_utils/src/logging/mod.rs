//! Tracing setup for the wgns binaries.
//!
//! Interactive commands log to stdout only. Long-running ones (the watcher)
//! also keep a daily-rotated file next to the proxy logs so a supervised
//! process leaves a trail after its terminal is gone. A non-empty `RUST_LOG`
//! replaces the configured level.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Line format of every sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Daily-rotated file sink: `<dir>/<prefix>.YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSink {
    pub dir: PathBuf,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub format: LogFormat,
    pub stdout: bool,
    pub file: Option<FileSink>,
    /// Attach source file and line to each event.
    pub source_location: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            stdout: true,
            file: None,
            source_location: false,
        }
    }
}

impl LogOptions {
    /// Stdout at the configured level.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            level: parse_level(&config.log_level),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.file = Some(FileSink {
            dir: dir.into(),
            prefix: prefix.into(),
        });
        self
    }
}

/// Map a textual level to a [`Level`], falling back to INFO.
pub fn parse_level(value: &str) -> Level {
    value.trim().parse().unwrap_or(Level::INFO)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn sink_layer<W>(writer: W, options: &LogOptions, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(options.source_location)
        .with_line_number(options.source_location);
    match options.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber. Keep the returned guard alive until exit,
/// otherwise buffered file output is lost. A second call in one process is a
/// no-op.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if options.stdout {
        layers.push(sink_layer(std::io::stdout, &options, true));
    }

    let mut guard = None;
    if let Some(sink) = &options.file {
        let appender = RollingFileAppender::new(Rotation::DAILY, &sink.dir, &sink.prefix);
        let (writer, worker) = NonBlocking::new(appender);
        guard = Some(worker);
        layers.push(sink_layer(writer, &options, false));
    }

    let filter = EnvFilter::builder()
        .with_default_directive(options.level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    guard
}

/// Shorthand for [`LogOptions::from_config`] followed by [`init_logging`].
pub fn init_logging_from_config(config: &crate::config::Config) -> Option<WorkerGuard> {
    init_logging(LogOptions::from_config(config))
}
