//! Transporter trait: the pluggable backend contract
//!
//! Every backend (in-process loop-back, Cloud Pub/Sub, JetStream) implements
//! `Transporter`. Backends differ in push vs pull and ack vs fire-and-forget
//! delivery, but all of them hand inbound messages to Transit as an
//! [`Envelope`] through the delivery channel given to `subscribe`.

use crate::error::Result;
use crate::naming::Naming;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod internal;
pub mod jetstream;
pub mod pubsub;

pub use internal::InternalTransporter;
pub use jetstream::{JetStreamConfig, JetStreamTransporter};
pub use pubsub::{PubSubConfig, PubSubTransporter};

/// Producer dedup header carrying the event id
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// W3C trace-context header
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Message headers (name → value)
pub type Headers = HashMap<String, String>;

/// Channel inbound envelopes are pushed into
pub type Deliveries = mpsc::Sender<Envelope>;

/// Core trait for message bus backends
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Connect to the backend. Calling it again on a live connection is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Stop all listeners and release the connection
    async fn disconnect(&self) -> Result<()>;

    /// Publish raw bytes to a topic
    async fn publish(&self, topic: &str, data: Bytes, headers: &Headers) -> Result<()>;

    /// Subscribe `service_name` to `topic`
    ///
    /// Each (service, topic) pair gets its own backend subscription so
    /// services acknowledge independently. Every delivery is pushed into
    /// `deliveries` as an [`Envelope`].
    async fn subscribe(&self, service_name: &str, topic: &str, deliveries: Deliveries)
        -> Result<()>;

    /// Backend name (e.g., "internal", "pubsub", "jetstream")
    fn name(&self) -> &str;
}

/// Backend acknowledgement primitives for one delivered message
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm successful processing
    async fn ack(&self) -> Result<()>;

    /// Request redelivery
    async fn nak(&self) -> Result<()>;

    /// Mark terminally failed; the backend must never redeliver it
    async fn term(&self) -> Result<()>;
}

/// Acknowledger for fire-and-forget backends
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAcknowledger;

#[async_trait]
impl Acknowledger for NoopAcknowledger {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend-agnostic wrapper around one inbound delivery
#[derive(Clone)]
pub struct Envelope {
    /// Topic the subscription was made on (what services declare handlers for)
    pub topic: String,

    /// Concrete subject the message was published to
    pub subject: String,

    /// Raw message bytes
    pub data: Bytes,

    pub headers: Headers,

    /// Service the delivering subscription belongs to, for per-service backends
    pub subscriber: Option<String>,

    acknowledger: Arc<dyn Acknowledger>,
}

impl Envelope {
    /// Envelope with no headers and a no-op acknowledger
    pub fn new(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let topic = topic.into();
        Self {
            subject: topic.clone(),
            topic,
            data: data.into(),
            headers: Headers::new(),
            subscriber: None,
            acknowledger: Arc::new(NoopAcknowledger),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_subscriber(mut self, service_name: impl Into<String>) -> Self {
        self.subscriber = Some(service_name.into());
        self
    }

    pub fn with_acknowledger(mut self, acknowledger: Arc<dyn Acknowledger>) -> Self {
        self.acknowledger = acknowledger;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Acknowledge successful processing (no-op on fire-and-forget backends)
    pub async fn acknowledge(&self) -> Result<()> {
        self.acknowledger.ack().await
    }

    /// Negative-acknowledge, requesting redelivery
    pub async fn nak(&self) -> Result<()> {
        self.acknowledger.nak().await
    }

    /// Terminate, preventing any redelivery
    pub async fn term(&self) -> Result<()> {
        self.acknowledger.term().await
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("subject", &self.subject)
            .field("bytes", &self.data.len())
            .field("headers", &self.headers)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

/// Transporter selection, validated when the configuration is loaded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransporterConfig {
    /// In-process loop-back, no persistence
    #[default]
    Internal,
    /// Google Cloud Pub/Sub
    Pubsub(PubSubConfig),
    /// NATS JetStream
    Jetstream(JetStreamConfig),
}

/// Build the transporter selected by `config` (not yet connected)
pub fn from_config(config: &TransporterConfig, naming: &Naming) -> Result<Arc<dyn Transporter>> {
    let transporter: Arc<dyn Transporter> = match config {
        TransporterConfig::Internal => Arc::new(InternalTransporter::new()),
        TransporterConfig::Pubsub(cfg) => Arc::new(PubSubTransporter::new(cfg.clone())?),
        TransporterConfig::Jetstream(cfg) => {
            Arc::new(JetStreamTransporter::new(cfg.clone(), naming.clone()))
        }
    };

    tracing::info!(transporter = transporter.name(), "Transporter configured");
    Ok(transporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAcknowledger {
        acks: AtomicUsize,
        terms: AtomicUsize,
    }

    #[async_trait]
    impl Acknowledger for CountingAcknowledger {
        async fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> Result<()> {
            Ok(())
        }

        async fn term(&self) -> Result<()> {
            self.terms.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_envelope_delegates_to_acknowledger() {
        let acker = Arc::new(CountingAcknowledger::default());
        let envelope = Envelope::new("calc.add.v1", b"{}".to_vec())
            .with_acknowledger(acker.clone());

        envelope.acknowledge().await.unwrap();
        envelope.term().await.unwrap();

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.terms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_envelope_ack_is_noop() {
        let envelope = Envelope::new("calc.add.v1", Bytes::from_static(b"{}"));
        assert_eq!(envelope.subject, "calc.add.v1");
        assert!(envelope.subscriber.is_none());
        assert!(envelope.acknowledge().await.is_ok());
    }

    #[test]
    fn test_transporter_config_tagged() {
        let cfg: TransporterConfig = serde_json::from_str(r#"{"type":"internal"}"#).unwrap();
        assert!(matches!(cfg, TransporterConfig::Internal));

        let cfg: TransporterConfig = serde_json::from_str(
            r#"{"type":"pubsub","projectId":"demo","emulatorHost":"localhost:8085"}"#,
        )
        .unwrap();
        match cfg {
            TransporterConfig::Pubsub(p) => {
                assert_eq!(p.project_id, "demo");
                assert_eq!(p.emulator_host.as_deref(), Some("localhost:8085"));
            }
            other => panic!("unexpected config {:?}", other),
        }

        assert!(serde_json::from_str::<TransporterConfig>(r#"{"type":"kafka"}"#).is_err());
    }

    #[test]
    fn test_envelope_debug_hides_payload() {
        let envelope = Envelope::new("a.b", b"secret".to_vec());
        let debug = format!("{:?}", envelope);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("bytes: 6"));
    }
}
