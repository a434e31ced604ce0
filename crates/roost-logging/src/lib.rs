//! Structured logging setup for Roost
//!
//! Console output is JSONL by default, or pretty-printed for development.
//! File output is always JSONL, optionally rotated via tracing-appender.
//! `RUST_LOG` overrides the configured default level.
//!
//! # Quick Start
//!
//! ```ignore
//! use roost_logging::{LogConfig, RoostSubscriberBuilder};
//!
//! // JSONL to console
//! RoostSubscriberBuilder::new().init()?;
//!
//! // Pretty console, debug level
//! RoostSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//!
//! // Keep the guard alive for as long as file output is needed
//! let _guard = RoostSubscriberBuilder::new()
//!     .with_config(LogConfig::production("./logs".into()))
//!     .init()?;
//! ```

pub mod config;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};
use std::io;

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{MakeWriter, TestWriter};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Errors that can occur while installing the subscriber
#[derive(Debug, Error)]
pub enum LogInitError {
    /// Log directory or file could not be created
    #[error("Log file error: {0}")]
    Io(#[from] io::Error),

    /// A global subscriber is already installed
    #[error("Subscriber already set: {0}")]
    AlreadySet(String),
}

/// Builder for configuring and installing the global subscriber
pub struct RoostSubscriberBuilder {
    config: LogConfig,
}

impl RoostSubscriberBuilder {
    /// Default configuration: JSONL output to console
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Override the level for one target
    pub fn with_target_level(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.config.filters = self.config.filters.with_target(target, level);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Build the filter: `RUST_LOG` if set, otherwise the default level,
    /// plus any per-target overrides
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.default_level));
        for directive in self.config.filters.directives() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Warning: ignoring log directive {directive}: {e}"),
            }
        }
        filter
    }

    /// Install the subscriber globally.
    ///
    /// The returned guard flushes file output when dropped and must be kept
    /// alive while logging to a file.
    pub fn init(self) -> Result<Option<WorkerGuard>, LogInitError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        let console = &self.config.console;
        if console.enabled {
            let layer = match (console.pretty, console.test_writer) {
                (true, true) => pretty_layer(console.ansi, TestWriter::new()),
                (true, false) => pretty_layer(console.ansi, io::stdout),
                (false, true) => json_layer(&self.config.jsonl, TestWriter::new()),
                (false, false) => json_layer(&self.config.jsonl, io::stdout),
            };
            layers.push(layer);
        }

        if let Some(file) = &self.config.file {
            let (writer, file_guard) = file_writer(file)?;
            layers.push(json_layer(&self.config.jsonl, writer));
            guard = Some(file_guard);
        }

        let filter = self.env_filter();
        Registry::default()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LogInitError::AlreadySet(e.to_string()))?;

        Ok(guard)
    }
}

impl Default for RoostSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn pretty_layer<W>(ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_target(true)
        .with_writer(writer)
        .boxed()
}

fn json_layer<W>(jsonl: &JsonlConfig, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(jsonl.include_current_span)
        .with_span_list(jsonl.include_spans)
        .flatten_event(jsonl.flatten_events)
        .with_file(jsonl.include_location)
        .with_line_number(jsonl.include_location)
        .with_thread_ids(jsonl.include_thread_info)
        .with_writer(writer)
        .boxed()
}

/// Non-blocking writer for the configured log file
fn file_writer(file: &FileConfig) -> io::Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&file.directory)?;

    let rotation = match file.rotation {
        RotationStrategy::Never => {
            let path = file.directory.join(format!("{}.log", file.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file.prefix.clone())
        .filename_suffix("log");
    if let Some(max_files) = file.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&file.directory).map_err(io::Error::other)?;

    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to console with default settings
pub fn init_default() -> Result<Option<WorkerGuard>, LogInitError> {
    RoostSubscriberBuilder::new().init()
}

/// Pretty console output at debug level
pub fn init_development() -> Result<Option<WorkerGuard>, LogInitError> {
    RoostSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Minimal output for tests. Safe to call from every test.
pub fn init_testing() {
    let _ = RoostSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}
