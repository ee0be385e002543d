//! In-process loop-back transporter
//!
//! Publishes are delivered straight to every matching subscriber channel.
//! Nothing is persisted and nothing is pre-provisioned, so subscribing
//! never fails with `TopicNotFound`. Intended for tests and local runs.
//!
//! `publish` never waits on a full delivery channel. Overflow is forwarded
//! from a spawned task, so a handler can publish while the receive loop is
//! blocked on the worker pool. Overflowed deliveries may arrive out of order.

use super::{Deliveries, Envelope, Headers, Transporter};
use crate::error::{Result, TransitError};
use crate::naming::subject_matches;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;

/// Loop-back transporter with no persistence
#[derive(Default)]
pub struct InternalTransporter {
    connected: AtomicBool,
    /// topic pattern → delivery channels (one per distinct receiver)
    routes: RwLock<HashMap<String, Vec<Deliveries>>>,
}

impl InternalTransporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topic patterns with at least one subscriber
    pub fn route_count(&self) -> usize {
        self.routes.read().map(|r| r.len()).unwrap_or(0)
    }

    fn matching_routes(&self, subject: &str) -> Result<Vec<(String, Vec<Deliveries>)>> {
        let routes = self
            .routes
            .read()
            .map_err(|e| TransitError::Provider(format!("Route table lock poisoned: {}", e)))?;

        Ok(routes
            .iter()
            .filter(|(pattern, _)| subject_matches(subject, pattern))
            .map(|(pattern, senders)| (pattern.clone(), senders.clone()))
            .collect())
    }
}

#[async_trait]
impl Transporter for InternalTransporter {
    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("Internal transporter connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut routes = self
            .routes
            .write()
            .map_err(|e| TransitError::Provider(format!("Route table lock poisoned: {}", e)))?;
        routes.clear();
        tracing::info!("Internal transporter disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes, headers: &Headers) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransitError::Connection(
                "Internal transporter is not connected".to_string(),
            ));
        }

        for (pattern, senders) in self.matching_routes(topic)? {
            // One unbound envelope per pattern; dispatch fans out to services
            let envelope = Envelope::new(pattern.clone(), data.clone())
                .with_subject(topic)
                .with_headers(headers.clone());

            for sender in senders {
                match sender.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(envelope)) => {
                        let pattern = pattern.clone();
                        tokio::spawn(async move {
                            if sender.send(envelope).await.is_err() {
                                tracing::warn!(topic = %pattern, "Dropping delivery, receiver is closed");
                            }
                        });
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(topic = %pattern, "Dropping delivery, receiver is closed");
                    }
                }
            }
        }

        tracing::debug!(topic = %topic, bytes = data.len(), "Published internally");
        Ok(())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        topic: &str,
        deliveries: Deliveries,
    ) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransitError::Subscribe {
                topic: topic.to_string(),
                reason: "Internal transporter is not connected".to_string(),
            });
        }

        let mut routes = self
            .routes
            .write()
            .map_err(|e| TransitError::Provider(format!("Route table lock poisoned: {}", e)))?;
        let senders = routes.entry(topic.to_string()).or_default();
        if !senders.iter().any(|s| s.same_channel(&deliveries)) {
            senders.push(deliveries);
        }

        tracing::debug!(service = service_name, topic = %topic, "Subscribed internally");
        Ok(())
    }

    fn name(&self) -> &str {
        "internal"
    }
}
