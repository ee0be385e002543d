//! Google Cloud Pub/Sub transporter over the REST API
//!
//! Topics and subscriptions must be provisioned ahead of time. Each
//! (service, topic) pair reads from its own subscription named
//! `<service>-<topic>`, so services acknowledge independently.

use super::{Acknowledger, Deliveries, Envelope, Headers, Transporter};
use crate::error::{Result, TransitError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";

/// Cloud Pub/Sub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubConfig {
    pub project_id: String,

    /// `host:port` of a local emulator; plain HTTP, no auth
    #[serde(default)]
    pub emulator_host: Option<String>,

    /// OAuth2 bearer token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Messages requested per pull
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,

    /// Pause between pulls that returned nothing
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_messages() -> u32 {
    10
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            emulator_host: None,
            token: None,
            request_timeout_secs: default_request_timeout(),
            max_messages: default_max_messages(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl PubSubConfig {
    fn base_url(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{}/v1", host),
            None => PUBSUB_ENDPOINT.to_string(),
        }
    }
}

/// Subscription name for one (service, topic) pair
pub fn subscription_name(service_name: &str, topic: &str) -> String {
    format!("{}-{}", service_name, topic)
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<OutboundMessage<'a>>,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    data: String,
    attributes: &'a Headers,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// Thin REST client shared by the transporter, its listeners and acknowledgers
struct PubSubApi {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Option<String>,
}

impl PubSubApi {
    fn topic_path(&self, topic: &str) -> String {
        format!("{}/projects/{}/topics/{}", self.base_url, self.project_id, topic)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!(
            "{}/projects/{}/subscriptions/{}",
            self.base_url, self.project_id, subscription
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        target: &str,
    ) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransitError::Timeout(format!("Pub/Sub request to {} timed out", target))
            } else {
                TransitError::Connection(format!("Pub/Sub request to {} failed: {}", target, e))
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransitError::TopicNotFound(target.to_string()));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransitError::Provider(format!(
                "Pub/Sub returned {} for {}: {}",
                status, target, body
            )));
        }

        Ok(response)
    }

    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<PullResponse> {
        let url = format!("{}:pull", self.subscription_path(subscription));
        let response = self
            .send(
                self.request(reqwest::Method::POST, &url)
                    .json(&PullRequest { max_messages }),
                subscription,
            )
            .await?;

        response
            .json()
            .await
            .map_err(|e| TransitError::Provider(format!("Malformed pull response: {}", e)))
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        let url = format!("{}:acknowledge", self.subscription_path(subscription));
        self.send(
            self.request(reqwest::Method::POST, &url)
                .json(&serde_json::json!({ "ackIds": [ack_id] })),
            subscription,
        )
        .await
        .map_err(|e| TransitError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn modify_ack_deadline(&self, subscription: &str, ack_id: &str, secs: u32) -> Result<()> {
        let url = format!("{}:modifyAckDeadline", self.subscription_path(subscription));
        self.send(
            self.request(reqwest::Method::POST, &url).json(&serde_json::json!({
                "ackIds": [ack_id],
                "ackDeadlineSeconds": secs,
            })),
            subscription,
        )
        .await
        .map_err(|e| TransitError::Ack(e.to_string()))?;
        Ok(())
    }
}

/// Ack handle for one pulled message
struct PubSubAcknowledger {
    api: Arc<PubSubApi>,
    subscription: String,
    ack_id: String,
}

#[async_trait]
impl Acknowledger for PubSubAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.api.acknowledge(&self.subscription, &self.ack_id).await
    }

    /// A zero ack deadline makes the message immediately available again
    async fn nak(&self) -> Result<()> {
        self.api
            .modify_ack_deadline(&self.subscription, &self.ack_id, 0)
            .await
    }

    /// Pub/Sub has no terminal state; acknowledging stops redelivery
    async fn term(&self) -> Result<()> {
        self.api.acknowledge(&self.subscription, &self.ack_id).await
    }
}

/// Cloud Pub/Sub transporter
pub struct PubSubTransporter {
    api: Arc<PubSubApi>,
    config: PubSubConfig,
    connected: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl PubSubTransporter {
    pub fn new(config: PubSubConfig) -> Result<Self> {
        if config.project_id.is_empty() {
            return Err(TransitError::Configuration(
                "Pub/Sub transporter requires a projectId".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                TransitError::Configuration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            api: Arc::new(PubSubApi {
                http,
                base_url: config.base_url(),
                project_id: config.project_id.clone(),
                token: config.token.clone(),
            }),
            config,
            connected: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
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
impl Transporter for PubSubTransporter {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = format!(
            "{}/projects/{}/topics?pageSize=1",
            self.api.base_url, self.api.project_id
        );
        self.api
            .send(self.api.request(reqwest::Method::GET, &url), &url)
            .await
            .map_err(|e| match e {
                TransitError::Timeout(_) => e,
                other => TransitError::Connection(other.to_string()),
            })?;

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            project = %self.config.project_id,
            endpoint = %self.api.base_url,
            "Connected to Pub/Sub"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
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

        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(listeners = handles.len(), "Disconnected from Pub/Sub");
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes, headers: &Headers) -> Result<()> {
        let url = format!("{}:publish", self.api.topic_path(topic));
        let body = PublishRequest {
            messages: vec![OutboundMessage {
                data: BASE64.encode(&data),
                attributes: headers,
            }],
        };

        self.api
            .send(self.api.request(reqwest::Method::POST, &url).json(&body), topic)
            .await
            .map_err(|e| match e {
                TransitError::Timeout(_) | TransitError::TopicNotFound(_) => e,
                other => TransitError::Publish {
                    topic: topic.to_string(),
                    reason: other.to_string(),
                },
            })?;

        tracing::debug!(topic = %topic, bytes = data.len(), "Published to Pub/Sub");
        Ok(())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        topic: &str,
        deliveries: Deliveries,
    ) -> Result<()> {
        let subscription = subscription_name(service_name, topic);

        // Fails with TopicNotFound when the subscription was never provisioned
        let url = self.api.subscription_path(&subscription);
        self.api
            .send(self.api.request(reqwest::Method::GET, &url), &subscription)
            .await?;

        let api = self.api.clone();
        let service = service_name.to_string();
        let topic_name = topic.to_string();
        let max_messages = self.config.max_messages;
        let idle = Duration::from_millis(self.config.poll_interval_ms);

        let handle = tokio::spawn(async move {
            loop {
                let batch = match api.pull(&subscription, max_messages).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(
                            subscription = %subscription,
                            error = %e,
                            "Pub/Sub pull failed"
                        );
                        tokio::time::sleep(idle).await;
                        continue;
                    }
                };

                if batch.received_messages.is_empty() {
                    tokio::time::sleep(idle).await;
                    continue;
                }

                for received in batch.received_messages {
                    let data = match BASE64.decode(received.message.data.as_bytes()) {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::warn!(
                                subscription = %subscription,
                                error = %e,
                                "Dropping message with undecodable data"
                            );
                            continue;
                        }
                    };

                    let envelope = Envelope::new(topic_name.clone(), data)
                        .with_headers(received.message.attributes)
                        .with_subscriber(service.clone())
                        .with_acknowledger(Arc::new(PubSubAcknowledger {
                            api: api.clone(),
                            subscription: subscription.clone(),
                            ack_id: received.ack_id,
                        }));

                    if deliveries.send(envelope).await.is_err() {
                        tracing::debug!(subscription = %subscription, "Receiver closed, listener exiting");
                        return;
                    }
                }
            }
        });
        self.track(handle)?;

        tracing::info!(service = service_name, topic = %topic, "Subscribed to Pub/Sub");
        Ok(())
    }

    fn name(&self) -> &str {
        "pubsub"
    }
}
