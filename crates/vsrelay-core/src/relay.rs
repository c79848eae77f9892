//! Poll-dispatch loop.
//!
//! [`Relay`] owns the three collaborators for one run. Startup resolves the
//! resume point from the stored checkpoint, then each loop iteration:
//!
//! 1. returns [`Error::Cancelled`] if shutdown was requested,
//! 2. flushes the staged checkpoint when `period` has elapsed since the last
//!    flush check and the staged key moved past the last flushed key,
//! 3. reads up to `batch_size` events, waiting with [`Backoff`] on an empty
//!    read,
//! 4. converts and sends the batch in order, stopping at the first failure,
//!    and stages a checkpoint for the last acknowledged event,
//! 5. after a failure, rewinds the stream to the first undelivered event and
//!    waits with [`Backoff`] before reading it again. Streams that cannot
//!    rewind are read onward immediately.
//!
//! Every wait (read, send, backoff) also observes shutdown. No flush happens
//! after cancellation.

use std::convert::Infallible;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::checkpoint::{Checkpoint, CheckpointConfig, resolve_begin};
use crate::checkpoint_store::CheckpointStore;
use crate::config::{Config, format_duration};
use crate::envelope::{EnvelopeContext, PayloadEncoding, convert};
use crate::error::{Error, Result};
use crate::sink::EnvelopeSink;
use crate::source::{EventSource, EventStream, RemoteEvent};

/// Upper bound on events requested per read.
pub const MAX_EVENTS_BATCH: usize = 100;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Key the checkpoint is stored under.
    pub checkpoint_key: String,
    pub checkpoint: CheckpointConfig,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub event_type_namespace: String,
    pub encoding: PayloadEncoding,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            checkpoint_key: crate::config::DEFAULT_CHECKPOINT_KEY.to_string(),
            checkpoint: CheckpointConfig::default(),
            batch_size: MAX_EVENTS_BATCH,
            backoff: BackoffPolicy::default(),
            event_type_namespace: crate::envelope::DEFAULT_EVENT_TYPE_NAMESPACE.to_string(),
            encoding: PayloadEncoding::Json,
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            checkpoint_key: config.checkpoint.key.clone(),
            checkpoint: config.checkpoint.policy(),
            batch_size: MAX_EVENTS_BATCH,
            backoff: BackoffPolicy::default(),
            event_type_namespace: config.sink.event_type_namespace.clone(),
            encoding: config.payload_encoding()?,
        })
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Non-empty batches dispatched.
    pub batches: u64,
    pub events_delivered: u64,
    /// Batches that stopped before their last event.
    pub partial_failures: u64,
    pub empty_polls: u64,
    pub flushes: u64,
    /// Flush checks elided because nothing new was staged.
    pub flushes_skipped: u64,
}

/// Result of [`Relay::dispatch`].
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Events acknowledged before the first failure.
    pub delivered: usize,
    /// The failure that stopped the batch, if any.
    pub error: Option<Error>,
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_complete(&self, batch_len: usize) -> bool {
        self.error.is_none() && self.delivered == batch_len
    }
}

/// Relay from one event source to one sink.
pub struct Relay<S, K, C> {
    source: S,
    sink: K,
    store: C,
    settings: RelaySettings,
    ctx: EnvelopeContext,
    backoff: Backoff,
    stats: RelayStats,
    staged_key: Option<i64>,
    flushed_key: Option<i64>,
}

impl<S, K, C> std::fmt::Debug for Relay<S, K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("source", &self.ctx.source)
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<S, K, C> Relay<S, K, C>
where
    S: EventSource,
    K: EnvelopeSink,
    C: CheckpointStore,
{
    pub fn new(source: S, sink: K, store: C, settings: RelaySettings) -> Self {
        let ctx = EnvelopeContext::new(source.identity(), source.api_version(), settings.encoding)
            .with_namespace(settings.event_type_namespace.clone());
        let backoff = Backoff::new(settings.backoff.clone());
        Self {
            source,
            sink,
            store,
            settings,
            ctx,
            backoff,
            stats: RelayStats::default(),
            staged_key: None,
            flushed_key: None,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    #[must_use]
    pub fn store(&self) -> &C {
        &self.store
    }

    #[must_use]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    #[must_use]
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Run until cancelled or a fatal error occurs.
    ///
    /// Always ends in an error: [`Error::Cancelled`] after a shutdown
    /// request, otherwise the fatal error that stopped the run.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Error {
        let span = crate::relay_span!("relay", source = self.ctx.source.as_str());
        let outcome = self.run_inner(shutdown).instrument(span).await;
        let err = match outcome {
            Ok(never) => match never {},
            Err(err) => err,
        };

        let s = &self.stats;
        if err.is_cancelled() {
            tracing::info!(
                source = %self.ctx.source,
                batches = s.batches,
                delivered = s.events_delivered,
                partial_failures = s.partial_failures,
                flushes = s.flushes,
                "relay stopped"
            );
        } else {
            tracing::error!(
                source = %self.ctx.source,
                error = %err,
                batches = s.batches,
                delivered = s.events_delivered,
                "relay failed"
            );
        }
        err
    }

    async fn run_inner(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<Infallible> {
        if *shutdown.borrow() {
            return Err(cancelled());
        }

        let max_age = self.settings.checkpoint.max_age;
        if max_age.is_zero() {
            tracing::warn!("checkpoint max_age is 0: replay protection is disabled, every start begins at the source's current time");
        }

        let stored = self.store.get(&self.settings.checkpoint_key).await?;
        self.flushed_key = stored.as_ref().map(|cp| cp.last_event_key);
        self.staged_key = self.flushed_key;

        let now = self.source.current_time().await?;
        let plan = resolve_begin(now, stored.as_ref(), max_age);
        plan.log(max_age);

        let mut stream = self.source.open(plan.begin).await?;
        tracing::info!(
            begin = %plan.begin,
            period = %format_duration(self.settings.checkpoint.period),
            max_age = %format_duration(max_age),
            encoding = %self.settings.encoding,
            "relay started"
        );

        let result = self.poll_loop(&mut stream, &mut shutdown).await;
        stream.close().await;
        result
    }

    async fn poll_loop(
        &mut self,
        stream: &mut S::Stream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Infallible> {
        let period = self.settings.checkpoint.period;
        let mut last_flush_check = Instant::now();

        loop {
            if *shutdown.borrow() {
                return Err(cancelled());
            }

            if last_flush_check.elapsed() >= period {
                self.flush_if_advanced().await?;
                last_flush_check = Instant::now();
            }

            let batch_size = self.settings.batch_size;
            let batch = tokio::select! {
                biased;
                () = wait_cancelled(shutdown) => return Err(cancelled()),
                read = stream.read_next(batch_size) => read?,
            };

            if batch.is_empty() {
                self.stats.empty_polls += 1;
                let delay = self.backoff.next();
                tracing::trace!(delay_ms = delay.as_millis() as u64, "no new events, backing off");
                tokio::select! {
                    biased;
                    () = wait_cancelled(shutdown) => return Err(cancelled()),
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            let outcome = tokio::select! {
                biased;
                () = wait_cancelled(shutdown) => return Err(cancelled()),
                outcome = self.dispatch(&batch) => outcome,
            };
            let undelivered = batch.get(outcome.delivered).map(|e| e.key);
            self.after_dispatch(&batch, outcome).await?;

            let Some(key) = undelivered else {
                continue;
            };
            if stream.rewind_to(key).await {
                let delay = self.backoff.next();
                tracing::debug!(
                    event_key = key,
                    delay_ms = delay.as_millis() as u64,
                    "retrying undelivered events after backoff"
                );
                tokio::select! {
                    biased;
                    () = wait_cancelled(shutdown) => return Err(cancelled()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Convert and send `events` in order, stopping at the first failure.
    pub async fn dispatch(&self, events: &[RemoteEvent]) -> DispatchOutcome {
        for (delivered, event) in events.iter().enumerate() {
            let sent = match convert(event, &self.ctx) {
                Ok(envelope) => self.sink.send(&envelope).await.map_err(Error::from),
                Err(err) => Err(Error::from(err)),
            };
            match sent {
                Ok(()) => {
                    tracing::debug!(
                        event_key = event.key,
                        event_type = %event.type_name,
                        "event delivered"
                    );
                }
                Err(err) => {
                    return DispatchOutcome {
                        delivered,
                        error: Some(err),
                    };
                }
            }
        }
        DispatchOutcome {
            delivered: events.len(),
            error: None,
        }
    }

    async fn after_dispatch(
        &mut self,
        batch: &[RemoteEvent],
        outcome: DispatchOutcome,
    ) -> Result<()> {
        self.stats.batches += 1;
        self.stats.events_delivered += outcome.delivered as u64;

        if let Some(err) = &outcome.error {
            self.stats.partial_failures += 1;
            let failed_key = batch.get(outcome.delivered).map(|e| e.key);
            tracing::error!(
                batch_len = batch.len(),
                delivered = outcome.delivered,
                event_key = ?failed_key,
                error = %err,
                "could not send all events in batch"
            );
        }

        if outcome.delivered == 0 {
            return Ok(());
        }

        let last = &batch[outcome.delivered - 1];
        let checkpoint = Checkpoint {
            source: self.ctx.source.clone(),
            last_event_key: last.key,
            last_event_type: last.details().event_type,
            last_event_timestamp: last.created_time,
            written_at: Utc::now(),
        };
        self.store
            .stage(&self.settings.checkpoint_key, &checkpoint)
            .await?;
        self.staged_key = Some(last.key);
        self.backoff.reset();

        tracing::debug!(
            batch_len = batch.len(),
            delivered = outcome.delivered,
            checkpoint_key = last.key,
            "checkpoint staged"
        );
        Ok(())
    }

    async fn flush_if_advanced(&mut self) -> Result<()> {
        match self.staged_key {
            Some(staged) if self.flushed_key != Some(staged) => {
                self.store.flush().await?;
                self.flushed_key = Some(staged);
                self.stats.flushes += 1;
                tracing::debug!(checkpoint_key = staged, "checkpoint flushed");
            }
            _ => {
                self.stats.flushes_skipped += 1;
                tracing::trace!("checkpoint unchanged, flush skipped");
            }
        }
        Ok(())
    }
}

fn cancelled() -> Error {
    Error::Cancelled("shutdown requested".to_string())
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_store::MemoryCheckpointStore;
    use crate::error::{SinkError, SourceError};
    use crate::envelope::OutboundEnvelope;
    use chrono::{DateTime, TimeZone};
    use std::sync::Mutex;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn event(key: i64) -> RemoteEvent {
        RemoteEvent {
            key,
            created_time: at(1_700_000_000 + key),
            type_name: "VmCreatedEvent".to_string(),
            event_type_id: None,
            payload: serde_json::json!({ "key": key }),
        }
    }

    struct NoSource;

    struct NoStream;

    impl EventStream for NoStream {
        async fn read_next(&mut self, _max: usize) -> std::result::Result<Vec<RemoteEvent>, SourceError> {
            Ok(Vec::new())
        }
    }

    impl EventSource for NoSource {
        type Stream = NoStream;

        fn identity(&self) -> &str {
            "vc-test"
        }

        fn api_version(&self) -> &str {
            "8.0"
        }

        async fn current_time(&self) -> std::result::Result<DateTime<Utc>, SourceError> {
            Ok(at(1_700_000_000))
        }

        async fn open(&self, _begin: DateTime<Utc>) -> std::result::Result<NoStream, SourceError> {
            Ok(NoStream)
        }
    }

    /// Acks every envelope except those whose id is listed in `reject`.
    #[derive(Default)]
    struct PickySink {
        reject: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    impl EnvelopeSink for PickySink {
        async fn send(&self, envelope: &OutboundEnvelope) -> std::result::Result<(), SinkError> {
            self.seen.lock().unwrap().push(envelope.id.clone());
            if self.reject.contains(&envelope.id) {
                return Err(SinkError::Rejected {
                    status: 500,
                    message: "nope".to_string(),
                });
            }
            Ok(())
        }
    }

    fn relay(reject: &[&str]) -> Relay<NoSource, PickySink, MemoryCheckpointStore> {
        let sink = PickySink {
            reject: reject.iter().map(|s| (*s).to_string()).collect(),
            ..PickySink::default()
        };
        Relay::new(NoSource, sink, MemoryCheckpointStore::new(), RelaySettings::default())
    }

    #[tokio::test]
    async fn dispatch_all_acknowledged() {
        let r = relay(&[]);
        let batch: Vec<_> = (1..=3).map(event).collect();
        let outcome = r.dispatch(&batch).await;
        assert_eq!(outcome.delivered, 3);
        assert!(outcome.error.is_none());
        assert!(outcome.is_complete(batch.len()));
    }

    #[tokio::test]
    async fn dispatch_stops_at_first_rejection() {
        let r = relay(&["3"]);
        let batch: Vec<_> = (1..=5).map(event).collect();
        let outcome = r.dispatch(&batch).await;
        assert_eq!(outcome.delivered, 2);
        assert!(matches!(outcome.error, Some(Error::Sink(_))));
        assert!(!outcome.is_complete(batch.len()));
        assert_eq!(*r.sink().seen.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn dispatch_first_event_rejected() {
        let r = relay(&["1"]);
        let outcome = r.dispatch(&[event(1), event(2)]).await;
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn dispatch_empty_batch_is_complete() {
        let r = relay(&[]);
        let outcome = r.dispatch(&[]).await;
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.is_complete(0));
    }

    #[tokio::test]
    async fn partial_batch_stages_last_acknowledged_event() {
        let mut r = relay(&["3"]);
        let batch: Vec<_> = (1..=5).map(event).collect();
        let outcome = r.dispatch(&batch).await;
        r.after_dispatch(&batch, outcome).await.unwrap();

        let staged = r.store().get("vsphere-checkpoint").await.unwrap().unwrap();
        assert_eq!(staged.last_event_key, 2);
        assert_eq!(staged.last_event_timestamp, at(1_700_000_002));
        assert_eq!(staged.source, "vc-test");
        assert_eq!(r.stats().partial_failures, 1);
        assert_eq!(r.stats().events_delivered, 2);
    }

    #[tokio::test]
    async fn zero_delivered_does_not_stage() {
        let mut r = relay(&["1"]);
        let batch = vec![event(1), event(2)];
        let outcome = r.dispatch(&batch).await;
        r.after_dispatch(&batch, outcome).await.unwrap();
        assert!(r.store().get("vsphere-checkpoint").await.unwrap().is_none());
        assert_eq!(r.staged_key, None);
    }

    #[tokio::test]
    async fn successful_batch_resets_backoff() {
        let mut r = relay(&[]);
        r.backoff.next();
        r.backoff.next();
        let batch = vec![event(7)];
        let outcome = r.dispatch(&batch).await;
        r.after_dispatch(&batch, outcome).await.unwrap();
        assert_eq!(r.backoff.attempts(), 0);
    }

    #[tokio::test]
    async fn flush_is_elided_when_nothing_new_staged() {
        let mut r = relay(&[]);
        r.flush_if_advanced().await.unwrap();
        assert_eq!(r.store().flush_count(), 0);

        let batch = vec![event(1)];
        let outcome = r.dispatch(&batch).await;
        r.after_dispatch(&batch, outcome).await.unwrap();
        r.flush_if_advanced().await.unwrap();
        r.flush_if_advanced().await.unwrap();

        assert_eq!(r.store().flush_count(), 1);
        assert_eq!(r.stats().flushes, 1);
        assert_eq!(r.stats().flushes_skipped, 2);
    }

    #[tokio::test]
    async fn run_returns_cancelled_when_already_shut_down() {
        let mut r = relay(&[]);
        let (_tx, rx) = watch::channel(true);
        let err = r.run(rx).await;
        assert!(err.is_cancelled());
        assert_eq!(r.store().flush_count(), 0);
    }

    #[test]
    fn settings_from_config() {
        let mut config = Config::default();
        config.checkpoint.key = "vc01".to_string();
        config.checkpoint.period = Duration::from_secs(30);
        config.payload.encoding = "application/yaml".to_string();
        let settings = RelaySettings::from_config(&config).unwrap();
        assert_eq!(settings.checkpoint_key, "vc01");
        assert_eq!(settings.checkpoint.period, Duration::from_secs(30));
        assert_eq!(settings.encoding, PayloadEncoding::Yaml);
        assert_eq!(settings.batch_size, MAX_EVENTS_BATCH);
    }
}
