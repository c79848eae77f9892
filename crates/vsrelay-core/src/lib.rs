//! vsrelay-core: Core library for vsrelay
//!
//! Relays a vCenter-style event history to a CloudEvents sink with
//! at-least-once delivery and a bounded replay window after restarts.
//!
//! # Architecture
//!
//! ```text
//! CheckpointStore ──get──▶ resolve_begin ──▶ EventSource::open
//!        ▲                                        │
//!   stage/flush                              read_next (≤100)
//!        │                                        ▼
//!      Relay ◀──── ack/nack ──── EnvelopeSink ◀── convert
//! ```
//!
//! # Modules
//!
//! - `relay`: poll-dispatch loop and per-batch delivery
//! - `checkpoint`: checkpoint model and resume-point resolution
//! - `checkpoint_store`: staged/durable checkpoint backends (memory, JSON file, SQLite)
//! - `source`: remote event history traits and the JSON-lines history reader
//! - `envelope`: event to CloudEvents conversion and payload encodings
//! - `sink`: HTTP and line-oriented envelope sinks
//! - `backoff`: idle-poll backoff
//! - `config`: configuration management
//! - `logging`: structured logging setup
//! - `error`: error taxonomy with remediation hints

#![forbid(unsafe_code)]

pub mod backoff;
pub mod checkpoint;
pub mod checkpoint_store;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod relay;
pub mod sink;
pub mod source;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
