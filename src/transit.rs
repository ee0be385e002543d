//! Transit: the per-process publish/receive coordinator
//!
//! Transit ties a `Serializer`, a `Transporter` and a `ServiceManager`
//! together:
//!
//! - **publish** builds a domain-qualified event, validates and encodes it,
//!   then hands the bytes to the transporter with a dedup header.
//! - **receive** decodes and validates an inbound envelope and fans it out
//!   to interested services through the bounded worker pool.
//!
//! `start` subscribes every (service, topic) pair before reporting ready.
//! Fire-and-forget backends drop anything published before that point.

use crate::config::TransitConfig;
use crate::error::{Result, TransitError};
use crate::event::Event;
use crate::pool::WorkerPool;
use crate::schema::SchemaStore;
use crate::serializer::Serializer;
use crate::service::Context;
use crate::service_manager::ServiceManager;
use crate::telemetry;
use crate::transporter::{self, Envelope, Headers, Transporter, MSG_ID_HEADER};
use opentelemetry::trace::FutureExt as OtelFutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// How long shutdown waits for the receive loop to drain
const RECEIVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared receive path, owned by the receive loop task and by `Transit`
struct Inbound {
    serializer: Serializer,
    services: Arc<ServiceManager>,
    pool: Arc<WorkerPool>,
}

impl Inbound {
    async fn receive(&self, envelope: Envelope) -> Result<usize> {
        let remote_trace = telemetry::remote_trace_id(&envelope.headers);
        let otel_cx = telemetry::receive_context(&envelope.headers, &envelope.topic, "receive");
        let span = tracing::debug_span!(
            "receive",
            otel.name = %format!("{} receive", envelope.topic),
            topic = %envelope.topic,
            remote_trace = ?remote_trace
        );

        let result = async {
            let event = match self.serializer.deserialize(&envelope.data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        topic = %envelope.topic,
                        subject = %envelope.subject,
                        error = %e,
                        "Rejected inbound message"
                    );
                    return Err(e);
                }
            };

            tracing::debug!(event_id = %event.id(), "Event received");
            self.services
                .receive(Context::new(event, envelope.clone()), &self.pool)
                .await
        }
        .instrument(span)
        .with_context(otel_cx.clone())
        .await;

        telemetry::finish(&otel_cx, &result);
        result
    }
}

/// Central publish/receive coordinator
pub struct Transit {
    inbound: Arc<Inbound>,
    transporter: Arc<dyn Transporter>,
    trace_headers: bool,
    ready: AtomicBool,
    closed: AtomicBool,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Transit {
    /// Build the transporter named in `config` and start
    pub async fn from_config(
        config: &TransitConfig,
        schemas: Arc<SchemaStore>,
        services: ServiceManager,
    ) -> Result<Self> {
        let naming = config.naming()?;
        let transporter = transporter::from_config(&config.transporter, &naming)?;
        Self::start(config, schemas, services, transporter).await
    }

    /// Connect, attach every service subscription, then report ready
    ///
    /// A connect failure or any failed subscription aborts startup.
    pub async fn start(
        config: &TransitConfig,
        schemas: Arc<SchemaStore>,
        services: ServiceManager,
        transporter: Arc<dyn Transporter>,
    ) -> Result<Self> {
        config.validate()?;
        let naming = config.naming()?;

        transporter.connect().await?;

        let inbound = Arc::new(Inbound {
            serializer: Serializer::new(naming, schemas),
            services: Arc::new(services),
            pool: Arc::new(WorkerPool::new(&config.pool)?),
        });

        let (tx, mut rx) = mpsc::channel::<Envelope>(config.pool.queue_capacity);
        let loop_inbound = inbound.clone();
        let receive_loop = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let delivery = envelope.clone();
                // Failures are logged inside receive; the loop keeps going
                if let Err(TransitError::Validation(_)) = loop_inbound.receive(envelope).await {
                    if let Err(e) = delivery.term().await {
                        tracing::warn!(
                            topic = %delivery.topic,
                            error = %e,
                            "Failed to terminate invalid message"
                        );
                    }
                }
            }
            tracing::debug!("Receive loop stopped");
        });

        let transit = Self {
            inbound,
            transporter,
            trace_headers: config.trace_headers,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            receive_loop: Mutex::new(Some(receive_loop)),
        };

        let pairs = transit.inbound.services.topics();
        if let Err(e) = transit
            .subscribe_all(&pairs, tx, config.subscribe_timeout())
            .await
        {
            if let Err(close_err) = transit.shutdown().await {
                tracing::warn!(error = %close_err, "Cleanup after failed startup failed");
            }
            return Err(e);
        }

        transit.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            transporter = transit.transporter.name(),
            subscriptions = pairs.len(),
            "Transit ready"
        );
        Ok(transit)
    }

    /// Subscribe every (service, topic) pair; the first failure aborts
    async fn subscribe_all(
        &self,
        pairs: &[(String, String)],
        deliveries: mpsc::Sender<Envelope>,
        timeout: Duration,
    ) -> Result<()> {
        for (service, topic) in pairs {
            let subscribed = tokio::time::timeout(
                timeout,
                self.transporter.subscribe(service, topic, deliveries.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransitError::Timeout(format!(
                    "Subscribing '{}' to '{}' timed out",
                    service, topic
                )))
            });

            if let Err(e) = subscribed {
                tracing::error!(service = %service, topic = %topic, error = %e, "Subscribe failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Whether every subscription has been attached
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn serializer(&self) -> &Serializer {
        &self.inbound.serializer
    }

    pub fn services(&self) -> &ServiceManager {
        &self.inbound.services
    }

    pub fn transporter_name(&self) -> &str {
        self.transporter.name()
    }

    /// Publish `data` as an event of (unqualified) type `topic`
    pub async fn publish(&self, topic: &str, data: serde_json::Value) -> Result<Event> {
        let event = Event::new(self.inbound.serializer.naming(), topic, data)?;
        self.publish_event(&event).await?;
        Ok(event)
    }

    /// Publish a pre-built event
    pub async fn publish_event(&self, event: &Event) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransitError::Connection("Transit has been shut down".to_string()));
        }

        let serializer = &self.inbound.serializer;
        let subject = serializer.naming().trim_domain_prefix(event.event_type()).to_string();
        let span = tracing::info_span!(
            "send",
            otel.name = %format!("{} send", subject),
            event_id = %event.id()
        );
        let otel_cx = telemetry::send_context(&subject);

        let result = async {
            let bytes = serializer.serialize(event)?;

            let mut headers = Headers::new();
            headers.insert(MSG_ID_HEADER.to_string(), event.id().to_string());
            if self.trace_headers {
                telemetry::inject(&otel_cx, &mut headers);
            }

            self.transporter
                .publish(&subject, bytes.into(), &headers)
                .await?;

            tracing::debug!(subject = %subject, "Event published");
            Ok::<(), TransitError>(())
        }
        .instrument(span)
        .with_context(otel_cx.clone())
        .await;

        telemetry::finish(&otel_cx, &result);
        result
    }

    /// Decode an inbound envelope and dispatch it to services
    ///
    /// Returns the number of handler invocations queued. Invalid messages
    /// are logged and returned as `Validation` errors. Deliveries from
    /// subscriptions are terminated by the receive loop; callers of this
    /// method decide for themselves.
    pub async fn receive(&self, envelope: Envelope) -> Result<usize> {
        self.inbound.receive(envelope).await
    }

    /// Disconnect, stop the receive loop and drain in-flight handlers
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);

        self.transporter.disconnect().await?;

        let receive_loop = self
            .receive_loop
            .lock()
            .map_err(|e| TransitError::Provider(format!("Transit lock poisoned: {}", e)))?
            .take();

        if let Some(handle) = receive_loop {
            let abort = handle.abort_handle();
            if tokio::time::timeout(RECEIVE_DRAIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Receive loop did not drain in time, aborting");
                abort.abort();
            }
        }

        self.inbound.pool.shutdown().await?;
        tracing::info!("Transit shut down");
        Ok(())
    }
}
