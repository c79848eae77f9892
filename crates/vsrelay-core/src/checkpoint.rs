//! Checkpoint model and resume-point resolution.
//!
//! A [`Checkpoint`] records the last event that was positively acknowledged
//! by the sink. On startup [`resolve_begin`] turns the stored checkpoint, the
//! source's current time and the replay window into the timestamp the event
//! stream is opened at.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{duration_str, format_duration};
use crate::error::ConfigError;

/// Durable resume position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identity of the event source this checkpoint belongs to.
    pub source: String,
    /// Key of the last acknowledged event.
    pub last_event_key: i64,
    /// Type name of the last acknowledged event.
    pub last_event_type: String,
    /// Creation time of the last acknowledged event.
    pub last_event_timestamp: DateTime<Utc>,
    /// Wall-clock time the checkpoint was produced.
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// True when the checkpoint carries no usable resume position.
    ///
    /// A timestamp at or before the Unix epoch is treated as the zero value.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.last_event_timestamp <= DateTime::<Utc>::UNIX_EPOCH
    }
}

/// Checkpoint policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Replay window. Zero disables replay protection: every start begins at
    /// the source's current time.
    #[serde(with = "duration_str", default = "default_max_age")]
    pub max_age: Duration,
    /// Interval between durable flushes of the staged checkpoint.
    #[serde(with = "duration_str", default = "default_period")]
    pub period: Duration,
}

fn default_max_age() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_period() -> Duration {
    Duration::from_secs(10)
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            period: default_period(),
        }
    }
}

impl CheckpointConfig {
    /// Parse the JSON form, e.g. `{"maxAge":"1h","period":"30s"}`.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ConfigError::ParseError(format!("checkpoint config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::ValidationError(
                "checkpoint period must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the begin timestamp was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOrigin {
    /// No usable checkpoint: begin at the source's current time.
    Fresh,
    /// Resume exactly at the checkpoint timestamp.
    Checkpoint { event_key: i64 },
    /// The checkpoint is older than the replay window; events between the
    /// checkpoint and `begin` will not be replayed.
    Clamped {
        event_key: i64,
        checkpoint_timestamp: DateTime<Utc>,
    },
}

/// Result of [`resolve_begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub begin: DateTime<Utc>,
    pub origin: ResumeOrigin,
}

impl ResumePlan {
    /// True when resuming here skips events that were never delivered.
    #[must_use]
    pub fn loses_data(&self) -> bool {
        matches!(self.origin, ResumeOrigin::Clamped { .. })
    }

    /// Emit the resume decision to the log.
    pub fn log(&self, max_age: Duration) {
        match &self.origin {
            ResumeOrigin::Fresh => {
                tracing::info!(begin = %self.begin, "no checkpoint found, starting at source time");
            }
            ResumeOrigin::Checkpoint { event_key } => {
                tracing::info!(
                    begin = %self.begin,
                    checkpoint_key = event_key,
                    "resuming from checkpoint"
                );
            }
            ResumeOrigin::Clamped {
                event_key,
                checkpoint_timestamp,
            } => {
                tracing::warn!(
                    begin = %self.begin,
                    checkpoint_key = event_key,
                    checkpoint_timestamp = %checkpoint_timestamp,
                    max_age = %format_duration(max_age),
                    "potential data loss: checkpoint is older than the replay window, events in between are skipped"
                );
            }
        }
    }
}

/// Choose the timestamp the event stream is opened at.
///
/// * no checkpoint, or a zero one: `now`
/// * checkpoint within the window `[now - max_age, now]`: its timestamp
/// * checkpoint older than the window: `now - max_age` ([`ResumeOrigin::Clamped`])
///
/// The returned `begin` never exceeds `now` unless the checkpoint itself is
/// ahead of `now`, and is never earlier than `now - max_age`.
#[must_use]
pub fn resolve_begin(
    now: DateTime<Utc>,
    checkpoint: Option<&Checkpoint>,
    max_age: Duration,
) -> ResumePlan {
    let Some(cp) = checkpoint.filter(|cp| !cp.is_zero()) else {
        return ResumePlan {
            begin: now,
            origin: ResumeOrigin::Fresh,
        };
    };

    let floor = chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    if floor > cp.last_event_timestamp {
        ResumePlan {
            begin: floor,
            origin: ResumeOrigin::Clamped {
                event_key: cp.last_event_key,
                checkpoint_timestamp: cp.last_event_timestamp,
            },
        }
    } else {
        ResumePlan {
            begin: cp.last_event_timestamp,
            origin: ResumeOrigin::Checkpoint {
                event_key: cp.last_event_key,
            },
        }
    }
}
