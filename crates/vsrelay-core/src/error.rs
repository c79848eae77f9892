//! Error types for vsrelay-core

use std::fmt::Write;
use thiserror::Error;

/// A command the operator can run to diagnose or fix a failure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// What running the command achieves
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Operator guidance attached to an error and printed by the CLI
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One line on what to change
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    /// Other things worth checking
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Plain-text block written to stderr after the error line
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// `Result` over [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vsrelay-core
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream event history errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Downstream delivery errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint store errors
    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    /// Payload encoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint or event JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled by its owner
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// True for the cancellation outcome of a cooperative shutdown.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True when the error should terminate a run.
    ///
    /// Sink and encoding failures only abort the current batch; everything
    /// else is surfaced to the caller.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Sink(_) | Self::Encoding(_) | Self::Cancelled(_))
    }

    /// Guidance for the operator, if this error has any.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Source(err) => Some(err.remediation()),
            Self::Sink(err) => Some(err.remediation()),
            Self::Store(err) => Some(err.remediation()),
            Self::Encoding(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Validate config", "vsrelay config check")
                    .alternative("Verify the checkpoint directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Cancelled(_) => None,
        }
    }
}

/// Errors raised by the remote event history.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("get current time from source: {0}")]
    CurrentTime(String),

    #[error("open event stream at {begin}: {reason}")]
    Open { begin: String, reason: String },

    #[error("read events from source: {0}")]
    Read(String),

    #[error("malformed event record at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CurrentTime(_) | Self::Read(_) => Remediation::new(
                "The event source is unreachable. Check connectivity and restart the relay.",
            )
            .command("Validate config", "vsrelay config check")
            .alternative("The relay resumes from its last flushed checkpoint after a restart."),
            Self::Open { .. } => {
                Remediation::new("Could not open the event stream at the resolved position.")
                    .command("Inspect checkpoint", "vsrelay checkpoint show")
                    .alternative("Verify the source path or host in the [source] section.")
            }
            Self::Malformed { line, .. } => Remediation::new(format!(
                "Event record on line {line} could not be parsed. Repair or remove the record."
            ))
            .alternative("Each line must be one JSON event object."),
            Self::Io(_) => Remediation::new("Check that the history file exists and is readable.")
                .command("Validate config", "vsrelay config check"),
        }
    }
}

/// Delivery failures reported by the envelope sink (a negative acknowledgement).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink rejected event with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("sink transport failure: {0}")]
    Transport(String),

    #[error("sink closed")]
    Closed,
}

impl SinkError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Rejected { status, .. } => Remediation::new(format!(
                "The sink answered with HTTP {status}. Check the receiving broker's logs."
            ))
            .alternative("Undelivered events are re-read after a restart within the replay window."),
            Self::Transport(_) => {
                Remediation::new("The sink is unreachable. Check the [sink] url and network path.")
                    .command("Validate config", "vsrelay config check")
            }
            Self::Closed => Remediation::new("The sink was closed before the relay stopped.")
                .alternative("Restart the relay."),
        }
    }
}

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("checkpoint store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint document at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("unsupported checkpoint store location: {0}")]
    UnsupportedLocation(String),
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::Io(_) => Remediation::new(
                "The checkpoint store is unavailable. Check permissions on the store location.",
            )
            .command("Inspect checkpoint", "vsrelay checkpoint show")
            .alternative("Ensure the checkpoint directory is writable by the relay."),
            Self::Corrupt { location, .. } => Remediation::new(format!(
                "Checkpoint document {location} is unreadable. Move it aside to start fresh."
            ))
            .alternative("Without a checkpoint the relay starts at the source's current time."),
            Self::UnsupportedLocation(_) => Remediation::new(
                "Use a file path, sqlite://<path> or memory:// as the checkpoint store.",
            )
            .command("Validate config", "vsrelay config check"),
        }
    }
}

/// Payload encoding errors.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("unsupported payload encoding: {0}")]
    Unsupported(String),

    #[error("failed to encode payload as {encoding}: {reason}")]
    Serialize { encoding: String, reason: String },
}

impl EncodingError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unsupported(_) => Remediation::new(
                "Set [payload] encoding to application/json, application/yaml or application/xml.",
            )
            .command("Validate config", "vsrelay config check"),
            Self::Serialize { .. } => {
                Remediation::new("The event body could not be encoded. Try application/json.")
            }
        }
    }
}

/// Problems with the TOML config or the checkpoint policy blob
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or pass --config: {path}"))
                    .command("Validate config", "vsrelay config check --config <path>")
            }
            Self::ReadFailed(..) => {
                Remediation::new("Check that the config file is readable by the relay.")
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Validate config", "vsrelay config check"),
            Self::InvalidDuration { .. } => Remediation::new(
                "Durations use ms, s, m or h units, e.g. \"500ms\", \"10s\", \"1h30m\".",
            ),
            Self::ValidationError(_) => Remediation::new("Correct the reported setting.")
                .command("Validate config", "vsrelay config check"),
        }
    }
}
