//! Structured logging for vsrelay
//!
//! `tracing` with a pretty or JSON formatter on stderr and an optional log
//! file. `RUST_LOG` overrides the configured level.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `source`: identity of the upstream event history
//! - `event_key`, `event_type`: the event being converted or delivered
//! - `batch_len`, `delivered`: dispatch progress for one batch
//! - `checkpoint_key`: event key recorded in a staged or flushed checkpoint
//! - `begin`: timestamp the event stream was opened at
//!
//! Event payloads are never logged.

pub use crate::config::LogFormat;

use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static INSTALLED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error); `RUST_LOG` wins
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional log file, appended to alongside stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level {0:?}")]
    InvalidLevel(String),

    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber: stderr plus the optional log file, both in
/// the configured format. Only the first call succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = level_filter(&config.level)?;

    let mut layers: Vec<BoxedLayer> = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path).map_err(|source| LogError::File {
            path: path.display().to_string(),
            source,
        })?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;
    let _ = INSTALLED.set(());

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

pub fn is_logging_initialized() -> bool {
    INSTALLED.get().is_some()
}

/// `RUST_LOG` when set, otherwise the configured level.
fn level_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level: LogLevel = level
        .parse()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))?;
    Ok(EnvFilter::new(level.as_directive()))
}

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Open `path` for appending. New files are 0600 and new parent
/// directories 0700.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Span carrying the relay's correlation fields.
///
/// ```ignore
/// let span = vsrelay_core::relay_span!("relay", source = "vc01");
/// ```
#[macro_export]
macro_rules! relay_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}

/// Level names accepted in `general.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by [`EnvFilter`].
    #[must_use]
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            other => {
                return Err(format!(
                    "log_level {other:?} is not one of trace, debug, info, warn, error"
                ));
            }
        };
        Ok(level)
    }
}
