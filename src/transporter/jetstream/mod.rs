//! NATS JetStream transporter
//!
//! At-least-once delivery through pre-provisioned durable pull consumers.
//! Each (service, topic) pair binds the consumer
//! `<source_root>_<service>_<topic>` on whichever stream captures the topic.
//! Also serves as the production [`PullSource`] for `PullSubscriber`.
//!
//! Because the consumer name is derived from them, topics must be concrete
//! event types (no `*` or `>` wildcards) and service names must follow the
//! source grammar (lowercase alphanumerics separated by dots or colons).
//! Anything else fails `subscribe` with `Configuration`.
//!
//! `disconnect` unblocks in-flight `subscribe` and `fetch` calls, which then
//! fail with `Connection`.

mod client;
mod config;

pub use client::JetStreamClient;
pub use config::JetStreamConfig;

use super::{Acknowledger, Deliveries, Envelope, Headers, Transporter};
use crate::error::{Result, TransitError};
use crate::naming::Naming;
use crate::pull_subscriber::PullSource;
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Ack handle for one JetStream message
struct NatsAcknowledger {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| TransitError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| TransitError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| TransitError::Ack(e.to_string()))
    }
}

fn into_envelope(topic: &str, subscriber: Option<&str>, message: jetstream::Message) -> Envelope {
    let headers = client::plain_headers(message.headers.as_ref());
    let mut envelope = Envelope::new(topic, message.payload.clone())
        .with_subject(message.subject.to_string())
        .with_headers(headers);
    if let Some(service) = subscriber {
        envelope = envelope.with_subscriber(service);
    }
    envelope.with_acknowledger(Arc::new(NatsAcknowledger { message }))
}

/// NATS JetStream transporter
pub struct JetStreamTransporter {
    config: JetStreamConfig,
    naming: Naming,
    client: RwLock<Option<Arc<JetStreamClient>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every disconnect
    closing: watch::Sender<u64>,
}

impl JetStreamTransporter {
    pub fn new(config: JetStreamConfig, naming: Naming) -> Self {
        Self {
            config,
            naming,
            client: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            closing: watch::Sender::new(0),
        }
    }

    /// Connected client, or a `Connection` error before `connect`
    pub async fn client(&self) -> Result<Arc<JetStreamClient>> {
        self.client.read().await.clone().ok_or_else(|| {
            TransitError::Connection("JetStream transporter is not connected".to_string())
        })
    }

    /// Run `work`, giving up with `Connection` if `disconnect` is called
    /// before it completes
    async fn unless_disconnected<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let mut closing = self.closing.subscribe();
        tokio::select! {
            result = work => result,
            _ = closing.changed() => Err(TransitError::Connection(
                "JetStream transporter disconnected".to_string(),
            )),
        }
    }

    fn track(&self, handle: JoinHandle<()>) -> Result<()> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|e| TransitError::Provider(format!("Listener lock poisoned: {}", e)))?;
        listeners.push(handle);
        Ok(())
    }
}

#[async_trait]
impl Transporter for JetStreamTransporter {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(Arc::new(JetStreamClient::connect(self.config.clone()).await?));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.send_modify(|generation| *generation += 1);

        let handles: Vec<JoinHandle<()>> = {
            let mut listeners = self
                .listeners
                .lock()
                .map_err(|e| TransitError::Provider(format!("Listener lock poisoned: {}", e)))?;
            listeners.drain(..).collect()
        };
        for handle in &handles {
            handle.abort();
        }

        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.flush().await {
                tracing::warn!(error = %e, "Flush before disconnect failed");
            }
        }

        tracing::info!(listeners = handles.len(), "Disconnected from NATS");
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes, headers: &Headers) -> Result<()> {
        self.client().await?.publish(topic, data, headers).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        topic: &str,
        deliveries: Deliveries,
    ) -> Result<()> {
        let consumer_name = self
            .naming
            .consumer_name(topic, Some(service_name))
            .map_err(|e| {
                TransitError::Configuration(format!(
                    "Service '{}' cannot subscribe to '{}' over JetStream, no durable \
                     consumer name can be derived: {}",
                    service_name, topic, e
                ))
            })?;
        let client = self.client().await?;

        let (stream, messages) = self
            .unless_disconnected(async {
                let stream = client.stream_by_subject(topic).await?;
                let consumer = client.consumer(&stream, &consumer_name).await?;
                let messages = consumer.messages().await.map_err(|e| TransitError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
                Ok::<_, TransitError>((stream, messages))
            })
            .await?;

        let service = service_name.to_string();
        let topic_name = topic.to_string();
        let handle = tokio::spawn(async move {
            let mut messages = std::pin::pin!(messages);
            while let Some(msg) = messages.next().await {
                match msg {
                    Ok(msg) => {
                        let envelope = into_envelope(&topic_name, Some(&service), msg);
                        if deliveries.send(envelope).await.is_err() {
                            tracing::debug!(topic = %topic_name, "Receiver closed, listener exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(topic = %topic_name, error = %e, "Error receiving message");
                    }
                }
            }
        });
        self.track(handle)?;

        tracing::info!(
            service = service_name,
            topic = %topic,
            stream = %stream,
            consumer = %consumer_name,
            "Durable consumer bound"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "jetstream"
    }
}

#[async_trait]
impl PullSource for JetStreamTransporter {
    async fn stream_by_subject(&self, subject: &str) -> Result<String> {
        self.client().await?.stream_by_subject(subject).await
    }

    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool> {
        match self.client().await?.consumer(stream, consumer).await {
            Ok(_) => Ok(true),
            Err(TransitError::TopicNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<Envelope>> {
        let client = self.client().await?;
        let messages = self
            .unless_disconnected(async {
                let handle = client.consumer(stream, consumer).await?;
                client.fetch(&handle, batch, timeout).await
            })
            .await?;

        Ok(messages
            .into_iter()
            .map(|msg| {
                let subject = msg.subject.to_string();
                into_envelope(&subject, None, msg)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transporter() -> JetStreamTransporter {
        let naming = Naming::new("com.test", "user.backend").unwrap();
        JetStreamTransporter::new(JetStreamConfig::default(), naming)
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_connection_error() {
        let transporter = transporter();

        let err = transporter
            .publish("calc.add.v1", Bytes::new(), &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::Connection(_)));
        assert_eq!(transporter.name(), "jetstream");
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_ok() {
        assert!(transporter().disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_pending_work() {
        let transporter = transporter();

        let pending = tokio::time::timeout(
            Duration::from_secs(2),
            transporter.unless_disconnected(std::future::pending::<Result<()>>()),
        );
        let disconnect = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            transporter.disconnect().await
        };

        let (outcome, disconnected) = tokio::join!(pending, disconnect);
        disconnected.unwrap();
        let err = outcome.expect("work still blocked after disconnect").unwrap_err();
        assert!(matches!(err, TransitError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unless_disconnected_passes_result_through() {
        let value = transporter()
            .unless_disconnected(async { Ok::<_, TransitError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unnameable_consumer_before_connecting() {
        let transporter = transporter();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);

        let err = transporter
            .subscribe("calc-worker", "calc.add.v1", tx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitError::Configuration(_)));
        assert!(err.to_string().contains("calc-worker"));

        let err = transporter.subscribe("orders", "calc.>", tx).await.unwrap_err();
        assert!(matches!(err, TransitError::Configuration(_)));
    }
}
