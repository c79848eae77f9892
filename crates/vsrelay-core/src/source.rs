//! Remote event history.
//!
//! [`EventSource`] reports the upstream clock and opens an [`EventStream`] at
//! a begin timestamp; the stream yields key-ordered batches of
//! [`RemoteEvent`]s. [`HistoryFileSource`] reads a newline-delimited JSON
//! export of the history and keeps tailing it for appended records.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// API version reported when the source does not know its own.
pub const UNKNOWN_API_VERSION: &str = "unknown";

/// Class names used in the `eventclass` extension.
pub const CLASS_EVENT: &str = "event";
pub const CLASS_EVENT_EX: &str = "eventex";
pub const CLASS_EXTENDED_EVENT: &str = "extendedevent";

/// One record of the upstream event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    /// Monotonic key assigned by the upstream.
    pub key: i64,
    pub created_time: DateTime<Utc>,
    /// Concrete event type, e.g. `VmPoweredOnEvent`, `EventEx`, `ExtendedEvent`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Registered type id carried by `EventEx` and `ExtendedEvent` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_id: Option<String>,
    /// Full event body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Derived type/class pair used to name the outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetails {
    pub event_type: String,
    pub class: &'static str,
}

impl RemoteEvent {
    /// Type and class for this record.
    ///
    /// `EventEx` and `ExtendedEvent` are generic carriers; their meaningful
    /// type is the registered `event_type_id`. Everything else is named by
    /// its concrete type.
    #[must_use]
    pub fn details(&self) -> EventDetails {
        let id_or_type = || {
            self.event_type_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .unwrap_or(&self.type_name)
                .to_string()
        };
        match self.type_name.as_str() {
            "EventEx" => EventDetails {
                event_type: id_or_type(),
                class: CLASS_EVENT_EX,
            },
            "ExtendedEvent" => EventDetails {
                event_type: id_or_type(),
                class: CLASS_EXTENDED_EVENT,
            },
            _ => EventDetails {
                event_type: self.type_name.clone(),
                class: CLASS_EVENT,
            },
        }
    }
}

/// Upstream handle: clock plus stream factory.
#[allow(async_fn_in_trait)]
pub trait EventSource: Send + Sync {
    type Stream: EventStream;

    /// Identity stamped on envelopes and checkpoints.
    fn identity(&self) -> &str;

    /// Version string for the `vsphereapiversion` extension.
    fn api_version(&self) -> &str;

    /// The upstream's notion of "now".
    async fn current_time(&self) -> Result<DateTime<Utc>, SourceError>;

    /// Open a stream yielding events created at or after `begin`.
    async fn open(&self, begin: DateTime<Utc>) -> Result<Self::Stream, SourceError>;
}

/// An open, forward-only cursor over the event history.
#[allow(async_fn_in_trait)]
pub trait EventStream: Send {
    /// Up to `max` next events in key order. An empty batch means "nothing
    /// new yet", not end of stream.
    async fn read_next(&mut self, max: usize) -> Result<Vec<RemoteEvent>, SourceError>;

    /// Reposition so the next read starts again at `key`, an event returned
    /// by the last read that was not delivered. Returns `false` when the
    /// stream cannot go back, in which case reading continues past it.
    async fn rewind_to(&mut self, _key: i64) -> bool {
        false
    }

    /// Release the upstream handle.
    async fn close(&mut self) {}
}

/// Event history exported as JSON lines, one [`RemoteEvent`] per line.
#[derive(Debug, Clone)]
pub struct HistoryFileSource {
    path: PathBuf,
    identity: String,
    api_version: String,
}

impl HistoryFileSource {
    /// Source over `path`; the identity defaults to the file stem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let identity = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "history".to_string());
        Self {
            path,
            identity,
            api_version: UNKNOWN_API_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSource for HistoryFileSource {
    type Stream = HistoryFileStream;

    fn identity(&self) -> &str {
        &self.identity
    }

    fn api_version(&self) -> &str {
        &self.api_version
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, SourceError> {
        Ok(Utc::now())
    }

    async fn open(&self, begin: DateTime<Utc>) -> Result<HistoryFileStream, SourceError> {
        if !self.path.is_file() {
            return Err(SourceError::Open {
                begin: begin.to_rfc3339(),
                reason: format!("history file {} not found", self.path.display()),
            });
        }
        tracing::debug!(
            source = %self.identity,
            path = %self.path.display(),
            begin = %begin,
            "opened history file stream"
        );
        Ok(HistoryFileStream {
            path: self.path.clone(),
            begin,
            offset: 0,
            line: 0,
            last_read: Vec::new(),
            closed: false,
        })
    }
}

/// Cursor into a [`HistoryFileSource`].
///
/// Only complete (newline-terminated) lines are consumed, so a record that
/// is still being appended is picked up by a later read. The start of every
/// record in the last batch is remembered so an undelivered tail can be read
/// again.
#[derive(Debug)]
pub struct HistoryFileStream {
    path: PathBuf,
    begin: DateTime<Utc>,
    offset: u64,
    line: usize,
    last_read: Vec<RecordStart>,
    closed: bool,
}

/// Where a record of the last batch begins.
#[derive(Debug, Clone, Copy)]
struct RecordStart {
    key: i64,
    offset: u64,
    line: usize,
}

impl HistoryFileStream {
    /// Byte offset of the next unread line.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl EventStream for HistoryFileStream {
    async fn read_next(&mut self, max: usize) -> Result<Vec<RemoteEvent>, SourceError> {
        if self.closed {
            return Err(SourceError::Read("stream is closed".to_string()));
        }
        let mut batch = Vec::new();
        self.last_read.clear();
        if max == 0 {
            return Ok(batch);
        }

        let mut file = std::fs::File::open(&self.path)?;
        if file.metadata()?.len() < self.offset {
            return Err(SourceError::Read(format!(
                "history file {} was truncated",
                self.path.display()
            )));
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);
        let mut buf = String::new();

        while batch.len() < max {
            buf.clear();
            let n = reader.read_line(&mut buf)?;
            if n == 0 || !buf.ends_with('\n') {
                break;
            }
            let (start_offset, start_line) = (self.offset, self.line);
            self.offset += n as u64;
            self.line += 1;

            let record = buf.trim();
            if record.is_empty() {
                continue;
            }
            let event: RemoteEvent =
                serde_json::from_str(record).map_err(|e| SourceError::Malformed {
                    line: self.line,
                    reason: e.to_string(),
                })?;
            if event.created_time < self.begin {
                continue;
            }
            self.last_read.push(RecordStart {
                key: event.key,
                offset: start_offset,
                line: start_line,
            });
            batch.push(event);
        }
        Ok(batch)
    }

    async fn rewind_to(&mut self, key: i64) -> bool {
        let Some(start) = self.last_read.iter().find(|r| r.key == key).copied() else {
            return false;
        };
        tracing::debug!(
            event_key = key,
            offset = start.offset,
            skipped_back = self.offset - start.offset,
            "rewound history file stream"
        );
        self.offset = start.offset;
        self.line = start.line;
        self.last_read.clear();
        true
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
