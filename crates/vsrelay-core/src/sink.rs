//! Envelope delivery.
//!
//! A sink acknowledges an envelope by returning `Ok(())`. Any error is a
//! negative acknowledgement for that envelope.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::envelope::{CLOUDEVENTS_SPEC_VERSION, OutboundEnvelope};
use crate::error::SinkError;

/// Downstream receiver of envelopes.
#[allow(async_fn_in_trait)]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), SinkError>;
}

impl<T: EnvelopeSink + ?Sized> EnvelopeSink for Arc<T> {
    async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), SinkError> {
        (**self).send(envelope).await
    }
}

/// HTTP sink using the CloudEvents binary content mode: attributes travel as
/// `ce-*` headers and the encoded payload is the request body.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(SinkError::Transport("sink url must not be empty".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SinkError::Transport(format!("http client build failed: {err}")))?;
        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn headers(envelope: &OutboundEnvelope) -> Result<HeaderMap, SinkError> {
        let value = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|e| SinkError::Transport(format!("invalid header value {v:?}: {e}")))
        };

        let mut headers = HeaderMap::new();
        headers.insert("ce-specversion", HeaderValue::from_static(CLOUDEVENTS_SPEC_VERSION));
        headers.insert("ce-id", value(&envelope.id)?);
        headers.insert("ce-source", value(&envelope.source)?);
        headers.insert("ce-type", value(&envelope.event_type)?);
        headers.insert(
            "ce-time",
            value(&envelope.time.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))?,
        );
        headers.insert(CONTENT_TYPE, value(&envelope.data_content_type)?);
        for (name, v) in &envelope.extensions {
            let name = HeaderName::from_bytes(format!("ce-{name}").as_bytes())
                .map_err(|e| SinkError::Transport(format!("invalid extension name {name}: {e}")))?;
            headers.insert(name, value(v)?);
        }
        Ok(headers)
    }
}

impl EnvelopeSink for HttpSink {
    async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .headers(Self::headers(envelope)?)
            .body(envelope.data.clone())
            .send()
            .await
            .map_err(|err| SinkError::Transport(format!("post {}: {err}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Writes each envelope as one structured-mode JSON line. Always acknowledges
/// unless the writer fails.
#[derive(Debug)]
pub struct LineSink<W> {
    out: std::sync::Mutex<W>,
}

/// [`LineSink`] on standard output, used for dry runs.
pub type StdoutSink = LineSink<std::io::Stdout>;

impl StdoutSink {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: std::sync::Mutex::new(out),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EnvelopeSink for LineSink<W> {
    async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), SinkError> {
        let line = envelope
            .to_structured_json()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let mut out = self.out.lock().map_err(|_| SinkError::Closed)?;
        writeln!(out, "{line}").map_err(|e| SinkError::Transport(e.to_string()))?;
        out.flush().map_err(|e| SinkError::Transport(e.to_string()))
    }
}
