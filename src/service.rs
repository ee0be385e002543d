//! Service definitions and the per-invocation handler context
//!
//! A service is a named, immutable map of topic → handler built once at
//! startup:
//!
//! ```rust,no_run
//! use a3s_transit::{Context, ServiceDefinition};
//!
//! #[derive(Default)]
//! struct Calculator;
//!
//! impl Calculator {
//!     async fn add(self, ctx: Context) -> anyhow::Result<()> {
//!         let a = ctx.data()["a"].as_i64().unwrap_or_default();
//!         let b = ctx.data()["b"].as_i64().unwrap_or_default();
//!         tracing::info!(sum = a + b, "added");
//!         ctx.acknowledge().await?;
//!         Ok(())
//!     }
//! }
//!
//! let calculator = ServiceDefinition::builder::<Calculator>("calculator")
//!     .event("calc.add.v1", Calculator::add)
//!     .build()
//!     .unwrap();
//! ```
//!
//! Every delivery creates a fresh `S::default()` instance that handles
//! exactly one message and is then dropped, so no handler state outlives
//! the message that produced it.

use crate::error::{Result, TransitError};
use crate::event::Event;
use crate::transporter::Envelope;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-erased handler: builds a fresh instance and runs it on one context
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One delivered event bound to the raw message it came from
#[derive(Debug, Clone)]
pub struct Context {
    event: Event,
    envelope: Envelope,
}

impl Context {
    pub fn new(event: Event, envelope: Envelope) -> Self {
        Self { event, envelope }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Event payload
    pub fn data(&self) -> &serde_json::Value {
        self.event.data()
    }

    /// Topic the event was dispatched on
    pub fn topic(&self) -> &str {
        &self.envelope.topic
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.envelope.header(name)
    }

    /// Confirm the message was handled; the backend will not redeliver it
    pub async fn acknowledge(&self) -> Result<()> {
        self.envelope.acknowledge().await
    }
}

/// Immutable service definition: a name plus topic → handler
pub struct ServiceDefinition {
    name: String,
    handlers: BTreeMap<String, Handler>,
}

impl ServiceDefinition {
    /// Start defining a service whose handlers run on a fresh `S` per message
    pub fn builder<S>(name: impl Into<String>) -> ServiceBuilder<S>
    where
        S: Default + Send + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            handlers: BTreeMap::new(),
            error: None,
            _instance: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared topics, sorted
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handler(&self, topic: &str) -> Option<&Handler> {
        self.handlers.get(topic)
    }

    pub fn handles(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`ServiceDefinition`]
pub struct ServiceBuilder<S> {
    name: String,
    handlers: BTreeMap<String, Handler>,
    error: Option<TransitError>,
    _instance: PhantomData<fn() -> S>,
}

impl<S> ServiceBuilder<S>
where
    S: Default + Send + 'static,
{
    /// Declare a handler for an exact topic
    ///
    /// `handler` receives a freshly constructed `S` and the message context.
    pub fn event<F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(S, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let topic = topic.into();
        if self.error.is_some() {
            return self;
        }

        if topic.trim().is_empty() {
            self.error = Some(TransitError::Configuration(format!(
                "Service '{}' declares an event handler with an empty topic",
                self.name
            )));
            return self;
        }

        if self.handlers.contains_key(&topic) {
            self.error = Some(TransitError::Configuration(format!(
                "Service '{}' declares more than one handler for topic '{}'",
                self.name, topic
            )));
            return self;
        }

        let erased: Handler =
            Arc::new(move |ctx: Context| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler(S::default(), ctx))
            });
        self.handlers.insert(topic, erased);
        self
    }

    /// Finalize the definition
    pub fn build(self) -> Result<ServiceDefinition> {
        if self.name.trim().is_empty() {
            return Err(TransitError::ServiceName(self.name));
        }
        if let Some(err) = self.error {
            return Err(err);
        }

        Ok(ServiceDefinition {
            name: self.name,
            handlers: self.handlers,
        })
    }
}
