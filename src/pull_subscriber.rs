//! Validating wrapper around a pre-provisioned durable pull consumer
//!
//! Consumers are provisioned out of band. Construction fails when the
//! consumer is missing instead of creating one implicitly.
//!
//! Each fetched message is deserialized and validated. The first message
//! that fails is terminated on the backend so it is never redelivered, and
//! the fetch returns that error without yielding anything after it. Messages
//! that are returned are never acknowledged here; that is up to the caller.

use crate::error::{Result, TransitError};
use crate::event::Event;
use crate::serializer::Serializer;
use crate::telemetry;
use crate::transporter::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Backend primitives needed for pull consumption
#[async_trait]
pub trait PullSource: Send + Sync {
    /// Name of the stream that captures `subject`
    async fn stream_by_subject(&self, subject: &str) -> Result<String>;

    /// Whether the durable consumer exists on `stream`
    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool>;

    /// Request up to `batch` messages, waiting at most `timeout`
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<Envelope>>;
}

/// Options for one fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchParams {
    /// How long the request may wait for messages
    pub timeout: Duration,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl FetchParams {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// A validated event plus the raw message it came from
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub event: Event,
    pub envelope: Envelope,
}

impl ReceivedEvent {
    /// Acknowledge successful handling
    pub async fn ack(&self) -> Result<()> {
        self.envelope.acknowledge().await
    }

    /// Request redelivery
    pub async fn nak(&self) -> Result<()> {
        self.envelope.nak().await
    }
}

/// Pull consumer bound to one event type
pub struct PullSubscriber {
    source: Arc<dyn PullSource>,
    serializer: Serializer,
    event_type: String,
    consumer_name: String,
    stream: String,
}

impl PullSubscriber {
    /// Bind the consumer for `event_type`
    ///
    /// `source` extends the consumer name beyond the configured source root.
    pub async fn new(
        backend: Arc<dyn PullSource>,
        serializer: Serializer,
        event_type: &str,
        source: Option<&str>,
    ) -> Result<Self> {
        let naming = serializer.naming().clone();
        let event_type = naming.trim_domain_prefix(event_type).to_string();
        let consumer_name = naming.consumer_name(&event_type, source)?;

        let stream = backend
            .stream_by_subject(&event_type)
            .await
            .map_err(|e| match e {
                TransitError::TopicNotFound(reason) => TransitError::Validation(format!(
                    "Consumer {} does not exist, no stream captures '{}': {}",
                    consumer_name, event_type, reason
                )),
                other => other,
            })?;

        if !backend.consumer_exists(&stream, &consumer_name).await? {
            return Err(TransitError::Validation(format!(
                "Consumer {} does not exist. Provision it on stream {} before \
                 attempting to subscribe",
                consumer_name, stream
            )));
        }

        tracing::info!(
            event_type = %event_type,
            consumer = %consumer_name,
            stream = %stream,
            "Pull subscriber bound"
        );

        Ok(Self {
            source: backend,
            serializer,
            event_type,
            consumer_name,
            stream,
        })
    }

    /// Domain-trimmed event type
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Fetch and validate up to `batch` messages
    pub async fn fetch(&self, batch: usize, params: &FetchParams) -> Result<Vec<ReceivedEvent>> {
        let span = tracing::info_span!(
            "process",
            otel.name = %format!("{} process", self.event_type),
            consumer = %self.consumer_name
        );

        async {
            let envelopes = self
                .source
                .fetch(&self.stream, &self.consumer_name, batch, params.timeout)
                .await?;

            let mut received = Vec::with_capacity(envelopes.len());
            for envelope in envelopes {
                received.push(self.process(envelope).await?);
            }

            tracing::debug!(count = received.len(), "Batch fetched");
            Ok(received)
        }
        .instrument(span)
        .await
    }

    async fn process(&self, envelope: Envelope) -> Result<ReceivedEvent> {
        let span = tracing::debug_span!(
            "receive",
            otel.name = %format!("{} receive", self.event_type),
            bytes = envelope.data.len()
        );
        let otel_cx = telemetry::receive_context(&envelope.headers, &self.event_type, "receive");
        let decoded = {
            let _attached = otel_cx.clone().attach();
            span.in_scope(|| self.serializer.deserialize(&envelope.data))
        };
        telemetry::finish(&otel_cx, &decoded);

        match decoded {
            Ok(event) => Ok(ReceivedEvent { event, envelope }),
            Err(e) => {
                tracing::warn!(
                    consumer = %self.consumer_name,
                    error = %e,
                    "Terminating invalid message"
                );
                if let Err(term_err) = envelope.term().await {
                    tracing::error!(error = %term_err, "Failed to terminate invalid message");
                }
                Err(e)
            }
        }
    }
}
