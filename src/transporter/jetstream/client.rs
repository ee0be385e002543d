//! NATS JetStream client: connect, publish, bind consumers, fetch

use super::config::JetStreamConfig;
use crate::error::{Result, TransitError};
use crate::schema::KvSchemaBackend;
use crate::transporter::Headers;
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, Consumer};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;

/// Live JetStream connection
///
/// Unlike a broker-side admin client this never creates streams or
/// consumers; it only binds to what has already been provisioned.
pub struct JetStreamClient {
    client: async_nats::Client,
    context: jetstream::Context,
    config: JetStreamConfig,
}

impl JetStreamClient {
    /// Connect to NATS and open a JetStream context
    pub async fn connect(config: JetStreamConfig) -> Result<Self> {
        let client = build_connect_options(&config)
            .connect(&config.url)
            .await
            .map_err(|e| {
                if matches!(e.kind(), async_nats::ConnectErrorKind::TimedOut) {
                    TransitError::Timeout(format!("Connecting to {} timed out", config.url))
                } else {
                    TransitError::Connection(format!("{}: {}", config.url, e))
                }
            })?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let context = jetstream::new(client.clone());
        Ok(Self {
            client,
            context,
            config,
        })
    }

    /// Publish with headers and wait for the stream ack
    pub async fn publish(&self, subject: &str, payload: Bytes, headers: &Headers) -> Result<u64> {
        let mut header_map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
        }

        let ack_fut = self
            .context
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| TransitError::Publish {
                topic: subject.to_string(),
                reason: e.to_string(),
            })?;

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let ack = tokio::time::timeout(timeout, ack_fut)
            .await
            .map_err(|_| {
                TransitError::Timeout(format!(
                    "Publish ack timed out after {}s for subject '{}'",
                    self.config.request_timeout_secs, subject
                ))
            })?
            .map_err(|e| TransitError::Publish {
                topic: subject.to_string(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(subject = %subject, sequence = ack.sequence, "Message published");
        Ok(ack.sequence)
    }

    /// Name of the stream that captures `subject`
    pub async fn stream_by_subject(&self, subject: &str) -> Result<String> {
        self.context
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|e| {
                TransitError::TopicNotFound(format!(
                    "No stream captures subject '{}': {}",
                    subject, e
                ))
            })
    }

    /// Bind an existing durable pull consumer
    pub async fn consumer(&self, stream: &str, name: &str) -> Result<Consumer<pull::Config>> {
        let stream_handle = self.context.get_stream(stream).await.map_err(|e| {
            TransitError::TopicNotFound(format!("Stream '{}' does not exist: {}", stream, e))
        })?;

        stream_handle
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|e| {
                TransitError::TopicNotFound(format!(
                    "Consumer '{}' does not exist on stream '{}': {}",
                    name, stream, e
                ))
            })
    }

    /// Fetch up to `batch` messages, waiting at most `timeout`
    pub async fn fetch(
        &self,
        consumer: &Consumer<pull::Config>,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<jetstream::Message>> {
        let messages = consumer
            .batch()
            .max_messages(batch)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| TransitError::Provider(format!("Failed to fetch batch: {}", e)))?;

        let mut messages = std::pin::pin!(messages);
        let mut fetched = Vec::with_capacity(batch);
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(msg) => fetched.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "Error fetching message");
                    break;
                }
            }
        }

        Ok(fetched)
    }

    /// Open the schema bucket named in the configuration
    pub async fn schema_backend(&self) -> Result<KvSchemaBackend> {
        KvSchemaBackend::open(&self.context, &self.config.schema_bucket).await
    }

    /// Flush pending writes before the connection is dropped
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TransitError::Connection(format!("Flush failed: {}", e)))
    }

    pub fn jetstream_context(&self) -> &jetstream::Context {
        &self.context
    }

    pub fn config(&self) -> &JetStreamConfig {
        &self.config
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &JetStreamConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Copy NATS headers (first value per name) into plain headers
pub(crate) fn plain_headers(headers: Option<&async_nats::HeaderMap>) -> Headers {
    let mut plain = Headers::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                plain.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    plain
}
