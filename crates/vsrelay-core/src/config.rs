//! Configuration management for vsrelay
//!
//! Handles loading and validation of `vsrelay.toml` configuration files.
//! Every section is optional; missing keys fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointConfig;
use crate::envelope::{DEFAULT_EVENT_TYPE_NAMESPACE, PayloadEncoding};
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default checkpoint key inside the store.
pub const DEFAULT_CHECKPOINT_KEY: &str = "vsphere-checkpoint";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Upstream event history
    #[serde(default)]
    pub source: SourceConfig,

    /// Downstream envelope sink
    #[serde(default)]
    pub sink: SinkConfig,

    /// Checkpoint policy and store
    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    /// Payload encoding
    #[serde(default)]
    pub payload: PayloadConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty, json)
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which upstream implementation feeds the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Newline-delimited JSON event history export
    #[default]
    HistoryFile,
}

/// Upstream event history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Location of the history (file path for `history_file`)
    #[serde(default = "default_source_path")]
    pub path: PathBuf,

    /// Identity stamped on envelopes and checkpoints; defaults to the source's own
    #[serde(default)]
    pub identity: Option<String>,

    /// API version reported in the `vsphereapiversion` extension
    #[serde(default)]
    pub api_version: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::HistoryFile,
            path: default_source_path(),
            identity: None,
            api_version: None,
        }
    }
}

fn default_source_path() -> PathBuf {
    PathBuf::from("history.jsonl")
}

/// Envelope sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink address (HTTP endpoint)
    #[serde(default)]
    pub url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace used in `<namespace>.<type>.v0`
    #[serde(default = "default_namespace")]
    pub event_type_namespace: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: default_sink_timeout_ms(),
            event_type_namespace: default_namespace(),
        }
    }
}

impl SinkConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_sink_timeout_ms() -> u64 {
    10_000
}

fn default_namespace() -> String {
    DEFAULT_EVENT_TYPE_NAMESPACE.to_string()
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Store location: a JSON file path, `sqlite://<path>` or `memory://`
    #[serde(default = "default_store")]
    pub store: String,

    /// Key under which this relay's checkpoint is kept
    #[serde(default = "default_checkpoint_key")]
    pub key: String,

    /// Replay window; `0s` disables replay protection
    #[serde(default = "default_max_age", with = "duration_str")]
    pub max_age: Duration,

    /// Interval between durable flushes
    #[serde(default = "default_period", with = "duration_str")]
    pub period: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            store: default_store(),
            key: default_checkpoint_key(),
            max_age: default_max_age(),
            period: default_period(),
        }
    }
}

impl CheckpointSettings {
    #[must_use]
    pub fn policy(&self) -> CheckpointConfig {
        CheckpointConfig {
            max_age: self.max_age,
            period: self.period,
        }
    }

    /// Overlay a policy parsed from the JSON checkpoint-config blob.
    pub fn apply_policy(&mut self, policy: CheckpointConfig) {
        self.max_age = policy.max_age;
        self.period = policy.period;
    }
}

fn default_store() -> String {
    "checkpoints.json".to_string()
}

fn default_checkpoint_key() -> String {
    DEFAULT_CHECKPOINT_KEY.to_string()
}

fn default_max_age() -> Duration {
    CheckpointConfig::default().max_age
}

fn default_period() -> Duration {
    CheckpointConfig::default().period
}

/// Payload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Content type used to encode event bodies
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
        }
    }
}

fn default_encoding() -> String {
    PayloadEncoding::Json.content_type().to_string()
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    /// Render the resolved configuration as TOML
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Validate settings that would otherwise fail deep inside a run.
    pub fn validate(&self) -> crate::Result<()> {
        self.general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        if self.sink.url.trim().is_empty() {
            return Err(ConfigError::ValidationError("sink.url must be set".to_string()).into());
        }
        if self.sink.timeout_ms == 0 {
            return Err(
                ConfigError::ValidationError("sink.timeout_ms must be >= 1".to_string()).into(),
            );
        }
        if self.checkpoint.store.trim().is_empty() {
            return Err(
                ConfigError::ValidationError("checkpoint.store must be set".to_string()).into(),
            );
        }
        if self.checkpoint.key.trim().is_empty() {
            return Err(
                ConfigError::ValidationError("checkpoint.key must be set".to_string()).into(),
            );
        }
        self.checkpoint.policy().validate()?;
        self.payload_encoding()?;
        Ok(())
    }

    /// Parsed payload encoding
    pub fn payload_encoding(&self) -> crate::Result<PayloadEncoding> {
        Ok(self.payload.encoding.parse::<PayloadEncoding>()?)
    }
}

/// Parse a Go-style duration such as `"10s"`, `"500ms"`, `"1h30m"` or `"0"`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let s = value.trim();
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(amount),
            "us" => Duration::from_micros(amount),
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "" => return Err(invalid("missing unit (ns, us, ms, s, m, h)")),
            _ => return Err(invalid("unknown unit (expected ns, us, ms, s, m, h)")),
        };
        total = total.saturating_add(part);
    }
    Ok(total)
}

/// Format a duration in the same notation [`parse_duration`] accepts.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    // Sub-second values use the coarsest unit that is exact.
    let nanos = d.as_nanos();
    if nanos % 1_000 != 0 {
        return format!("{nanos}ns");
    }
    if nanos % 1_000_000 != 0 {
        return format!("{}us", nanos / 1_000);
    }
    if nanos % 1_000_000_000 != 0 {
        return format!("{}ms", nanos / 1_000_000);
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/// Serde adapter: durations as strings (`"10s"`) or bare integer seconds.
pub mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"10s\" or integer seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_duration(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
