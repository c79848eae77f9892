//! Fake collaborators for relay scenarios.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

use vsrelay_core::checkpoint::Checkpoint;
use vsrelay_core::checkpoint_store::{CheckpointStore, MemoryCheckpointStore};
use vsrelay_core::envelope::OutboundEnvelope;
use vsrelay_core::error::{SinkError, SourceError, StoreError};
use vsrelay_core::sink::EnvelopeSink;
use vsrelay_core::source::{EventSource, EventStream, RemoteEvent};

pub const T0: i64 = 1_700_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub fn event(key: i64) -> RemoteEvent {
    RemoteEvent {
        key,
        created_time: at(T0 + key),
        type_name: "VmReconfiguredEvent".to_string(),
        event_type_id: None,
        payload: serde_json::json!({ "key": key, "vm": format!("vm-{key}") }),
    }
}

pub fn events(keys: impl IntoIterator<Item = i64>) -> Vec<RemoteEvent> {
    keys.into_iter().map(event).collect()
}

pub fn checkpoint(key: i64, timestamp: DateTime<Utc>) -> Checkpoint {
    Checkpoint {
        source: "vc-fake".to_string(),
        last_event_key: key,
        last_event_type: "VmReconfiguredEvent".to_string(),
        last_event_timestamp: timestamp,
        written_at: timestamp,
    }
}

// =============================================================================
// Source
// =============================================================================

/// One scripted answer to `read_next`.
#[derive(Debug, Clone)]
pub enum Step {
    Batch(Vec<RemoteEvent>),
    Fail(String),
}

#[derive(Debug, Default)]
pub struct SourceLog {
    pub opened_at: Option<DateTime<Utc>>,
    pub reads: Vec<Instant>,
    pub closed: bool,
}

/// Source answering reads from a script; once exhausted every read is empty.
#[derive(Clone)]
pub struct ScriptedSource {
    now: Option<DateTime<Utc>>,
    script: Arc<Mutex<VecDeque<Step>>>,
    pub log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    pub fn new(now: DateTime<Utc>, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            now: Some(now),
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            log: Arc::default(),
        }
    }

    /// A source whose clock query fails.
    pub fn without_clock() -> Self {
        Self {
            now: None,
            script: Arc::default(),
            log: Arc::default(),
        }
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.log.lock().unwrap().opened_at
    }

    pub fn reads(&self) -> Vec<Instant> {
        self.log.lock().unwrap().reads.clone()
    }

    pub fn closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

pub struct ScriptedStream {
    script: Arc<Mutex<VecDeque<Step>>>,
    log: Arc<Mutex<SourceLog>>,
}

impl EventSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn identity(&self) -> &str {
        "vc-fake"
    }

    fn api_version(&self) -> &str {
        "8.0.2.0"
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, SourceError> {
        self.now
            .ok_or_else(|| SourceError::CurrentTime("connection refused".to_string()))
    }

    async fn open(&self, begin: DateTime<Utc>) -> Result<ScriptedStream, SourceError> {
        self.log.lock().unwrap().opened_at = Some(begin);
        Ok(ScriptedStream {
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
        })
    }
}

impl EventStream for ScriptedStream {
    async fn read_next(&mut self, max: usize) -> Result<Vec<RemoteEvent>, SourceError> {
        self.log.lock().unwrap().reads.push(Instant::now());
        match self.script.lock().unwrap().pop_front() {
            Some(Step::Batch(mut batch)) => {
                batch.truncate(max);
                Ok(batch)
            }
            Some(Step::Fail(reason)) => Err(SourceError::Read(reason)),
            None => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

// =============================================================================
// Sink
// =============================================================================

#[derive(Debug, Default)]
struct SinkState {
    attempts: Vec<String>,
    delivered: Vec<OutboundEnvelope>,
    reject_once: HashSet<String>,
    reject_always: HashSet<String>,
}

/// Sink that records every attempt and nacks configured envelope ids.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
    latency: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nack the first attempt for `key`, ack later ones.
    pub fn reject_once(self, key: i64) -> Self {
        self.state.lock().unwrap().reject_once.insert(key.to_string());
        self
    }

    /// Nack every attempt for `key`.
    pub fn reject_always(self, key: i64) -> Self {
        self.state
            .lock()
            .unwrap()
            .reject_always
            .insert(key.to_string());
        self
    }

    /// Delay every send by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Envelope ids in attempt order, including nacked ones.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn delivered(&self) -> Vec<OutboundEnvelope> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn delivered_keys(&self) -> Vec<i64> {
        self.delivered()
            .iter()
            .map(|e| e.id.parse().unwrap())
            .collect()
    }
}

impl EnvelopeSink for RecordingSink {
    async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), SinkError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.attempts.push(envelope.id.clone());
        if state.reject_always.contains(&envelope.id) || state.reject_once.remove(&envelope.id) {
            return Err(SinkError::Rejected {
                status: 503,
                message: "broker unavailable".to_string(),
            });
        }
        state.delivered.push(envelope.clone());
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Memory store whose operations can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryCheckpointStore,
    pub fail_get: bool,
    pub fail_stage: bool,
    pub fail_flush: bool,
}

fn unavailable() -> StoreError {
    StoreError::Io(std::io::Error::other("store unavailable"))
}

impl CheckpointStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        if self.fail_get {
            return Err(unavailable());
        }
        self.inner.get(key).await
    }

    async fn stage(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if self.fail_stage {
            return Err(unavailable());
        }
        self.inner.stage(key, checkpoint).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        if self.fail_flush {
            return Err(unavailable());
        }
        self.inner.flush().await
    }
}

/// Memory store pre-loaded with a durable checkpoint.
pub async fn seeded_store(key: &str, cp: &Checkpoint) -> Arc<MemoryCheckpointStore> {
    let store = MemoryCheckpointStore::new();
    store.stage(key, cp).await.unwrap();
    store.flush().await.unwrap();
    Arc::new(store)
}
