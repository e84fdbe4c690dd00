//! Logging configuration
//!
//! Thin configuration layer over `tracing-subscriber`. Defaults to JSON on
//! STDOUT; the returned guard must be held for the life of the process when
//! a non-blocking writer is used.
//!
//! ```no_run
//! use gantry::logging::{LogConfig, LogFormat, LogLevel};
//!
//! let _guard = LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .init();
//! ```

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

// Re-export the macros so embedders log the way the runtime does.
pub use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON (default).
    Json,
    /// Colored, multi-line; for development.
    Pretty,
    /// Single-line minimal output.
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Append to a single file.
    File(String),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    level: LogLevel,
    format: LogFormat,
    output: LogOutput,
    with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            with_target: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Install the global subscriber. Returns `None` when a subscriber is
    /// already set (tests, embedders with their own setup); the guard keeps
    /// the non-blocking writer alive otherwise.
    pub fn init(self) -> Option<WorkerGuard> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()));

        let (writer, guard) = match &self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            LogOutput::File(path) => {
                let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => file,
                    Err(err) => {
                        eprintln!("gantry: cannot open log file {}: {}", path, err);
                        return None;
                    }
                };
                tracing_appender::non_blocking(file)
            }
        };

        let builder = fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(self.with_target);

        let installed = match self.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
            LogFormat::Compact => builder.compact().try_init(),
        };

        match installed {
            Ok(()) => Some(guard),
            Err(_) => None,
        }
    }
}
