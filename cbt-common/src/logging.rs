//! Tracing setup shared by `cbtd` and `cbt-wkr`.
//!
//! Console output is pretty or JSON. When a log directory is configured,
//! a daily-rolling JSON file is written as well.

use crate::config::EnvParser;
use crate::errors::ErrorCode;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Console output goes to stderr instead of stdout.
    pub stderr: bool,
    pub dir: Option<PathBuf>,
    /// File name prefix of the rolling log, usually the binary name.
    pub file_prefix: String,
    /// Problems found while reading the environment, logged once
    /// the subscriber is installed.
    pub warnings: Vec<String>,
}

impl LogConfig {
    pub fn new(file_prefix: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            stderr: false,
            dir: None,
            file_prefix: file_prefix.into(),
            warnings: Vec::new(),
        }
    }

    /// Read `CBT_LOG_LEVEL`, `CBT_LOG_FORMAT` and `CBT_LOG_DIR`.
    pub fn from_env(file_prefix: impl Into<String>) -> Self {
        let mut config = Self::new(file_prefix);
        let mut parser = EnvParser::new();

        config.level = parser.get_log_level("LOG_LEVEL", "info").value;
        let format = parser.get_string("LOG_FORMAT", "pretty").value;
        config.dir = parser.get_optional_path("LOG_DIR").value;

        match format.parse() {
            Ok(format) => config.format = format,
            Err(e) => config.warnings.push(e),
        }
        config
            .warnings
            .extend(parser.take_errors().into_iter().map(|e| e.to_string()));
        config
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_stderr(mut self, stderr: bool) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(format!("{},hyper=warn,reqwest=warn", self.level))
                .unwrap_or_else(|_| EnvFilter::new("info"))
        })
    }
}

/// Keeps background log writers alive; drop on shutdown to flush.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// An unusable log directory disables file logging and is reported once
/// the console layer is up.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let console_writer = if config.stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let (pretty_layer, json_layer) = match config.format {
        LogFormat::Pretty => (
            Some(fmt::layer().with_writer(console_writer).with_target(true)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(console_writer),
            ),
        ),
    };

    let mut guards = Vec::new();
    let mut file_error = None;
    let file_layer = match &config.dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender =
                    tracing_appender::rolling::daily(dir, format!("{}.log", config.file_prefix));
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                Some(
                    fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_file(true)
                        .with_line_number(true)
                        .with_writer(writer),
                )
            }
            Err(e) => {
                file_error = Some(format!("cannot create log directory {}: {e}", dir.display()));
                None
            }
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(pretty_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            anyhow::anyhow!(
                "{}: failed to install tracing subscriber: {e}",
                ErrorCode::InternalLoggingError.code_string()
            )
        })?;

    if let Some(reason) = file_error {
        tracing::error!(
            error_code = %ErrorCode::InternalLoggingError.code_string(),
            "File logging disabled, {reason}"
        );
    }
    for warning in &config.warnings {
        tracing::warn!("{warning}");
    }

    Ok(LoggingGuards { _guards: guards })
}
