//! Immutable service registry and per-message fan-out
//!
//! Dispatch is by exact topic string. Every interested service gets its own
//! pool job; a failure or panic in one job is reported to the exception
//! handler and never reaches Transit or the other services.

use crate::error::{Result, TransitError};
use crate::exception::{
    panic_message, ExceptionHandler, FailureKind, HandlerFailure, LoggingExceptionHandler,
};
use crate::pool::{Job, WorkerPool};
use crate::service::{Context, ServiceDefinition};
use futures::FutureExt;
use opentelemetry::trace::FutureExt as OtelFutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// Read-only registry built once at startup
pub struct ServiceManager {
    services: Vec<Arc<ServiceDefinition>>,
    by_topic: HashMap<String, Vec<Arc<ServiceDefinition>>>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl ServiceManager {
    pub fn builder() -> ServiceManagerBuilder {
        ServiceManagerBuilder::default()
    }

    /// Every (service name, topic) pair that needs a subscription
    pub fn topics(&self) -> Vec<(String, String)> {
        self.services
            .iter()
            .flat_map(|service| {
                service
                    .topics()
                    .map(|topic| (service.name().to_string(), topic.to_string()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn services(&self) -> &[Arc<ServiceDefinition>] {
        &self.services
    }

    /// Services declaring a handler for exactly `topic`
    pub fn services_for(&self, topic: &str) -> &[Arc<ServiceDefinition>] {
        self.by_topic.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Build one job per interested service
    ///
    /// A context delivered by a per-service subscription only reaches the
    /// service that owns it. Jobs carry the current OpenTelemetry context, so
    /// events a handler publishes continue the inbound trace.
    pub fn dispatch(&self, context: &Context) -> Vec<Job> {
        let subscriber = context.envelope().subscriber.as_deref();

        self.services_for(context.topic())
            .iter()
            .filter(|service| subscriber.map_or(true, |name| name == service.name()))
            .filter_map(|service| {
                let handler = service.handler(context.topic())?.clone();
                let exceptions = self.exception_handler.clone();
                let service_name = service.name().to_string();
                let ctx = context.clone();
                let span = tracing::debug_span!(
                    "handler",
                    service = %service_name,
                    topic = %ctx.topic(),
                    event_id = %ctx.event().id()
                );

                let job: Job = Box::pin(
                    async move {
                        let event = ctx.event().clone();
                        let topic = ctx.topic().to_string();

                        let outcome = AssertUnwindSafe(async move { handler(ctx).await })
                            .catch_unwind()
                            .await;

                        let failure = match outcome {
                            Ok(Ok(())) => {
                                tracing::debug!("Handler completed");
                                return;
                            }
                            Ok(Err(e)) => HandlerFailure::new(
                                &service_name,
                                &topic,
                                &event,
                                FailureKind::Error,
                                format!("{:#}", e),
                            ),
                            Err(payload) => HandlerFailure::new(
                                &service_name,
                                &topic,
                                &event,
                                FailureKind::Panicked,
                                panic_message(payload.as_ref()),
                            ),
                        };

                        if let Err(e) = exceptions.handle_receive_exception(failure).await {
                            tracing::error!(error = %e, "Exception handler failed");
                        }
                    }
                    .instrument(span)
                    .with_current_context(),
                );
                Some(job)
            })
            .collect()
    }

    /// Fan `context` out to every interested service through `pool`
    ///
    /// Returns the number of dispatched invocations.
    pub async fn receive(&self, context: Context, pool: &WorkerPool) -> Result<usize> {
        let jobs = self.dispatch(&context);
        let count = jobs.len();

        if count == 0 {
            tracing::debug!(topic = %context.topic(), "No service handles topic");
        }

        for job in jobs {
            pool.submit(job).await?;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.services)
            .finish()
    }
}

/// Builder for [`ServiceManager`]
#[derive(Default)]
pub struct ServiceManagerBuilder {
    services: Vec<ServiceDefinition>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

impl ServiceManagerBuilder {
    pub fn service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    /// Replace the default logging exception handler
    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ServiceManager> {
        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name().to_string()) {
                return Err(TransitError::Configuration(format!(
                    "Service '{}' is registered more than once",
                    service.name()
                )));
            }
        }

        let services: Vec<Arc<ServiceDefinition>> =
            self.services.into_iter().map(Arc::new).collect();

        let mut by_topic: HashMap<String, Vec<Arc<ServiceDefinition>>> = HashMap::new();
        for service in &services {
            for topic in service.topics() {
                by_topic
                    .entry(topic.to_string())
                    .or_default()
                    .push(service.clone());
            }
        }

        tracing::debug!(
            services = services.len(),
            topics = by_topic.len(),
            "Service registry built"
        );

        Ok(ServiceManager {
            services,
            by_topic,
            exception_handler: self
                .exception_handler
                .unwrap_or_else(|| Arc::new(LoggingExceptionHandler)),
        })
    }
}
