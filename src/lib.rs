//! # a3s-transit
//!
//! Domain-qualified, schema-validated events over pluggable transporters.
//!
//! ## Overview
//!
//! `a3s-transit` is a client-side event bus framework. Applications publish
//! CloudEvents-shaped events whose `type` and `source` are qualified with an
//! organisation domain, and consume them through services that declare one
//! handler per topic. Every event is validated against the CloudEvents
//! envelope and its own registered JSON Schema on both publish and receive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_transit::{
//!     Context, InternalTransporter, SchemaStore, ServiceDefinition, ServiceManager, Transit,
//!     TransitConfig,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! async fn add(_: (), ctx: Context) -> anyhow::Result<()> {
//!     println!("received {}", ctx.data());
//!     ctx.acknowledge().await?;
//!     Ok(())
//! }
//!
//! # async fn example() -> a3s_transit::Result<()> {
//! let mut schemas = HashMap::new();
//! schemas.insert(
//!     "calc.add.v1".to_string(),
//!     serde_json::json!({"type": "object", "properties": {"data": {"type": "object"}}}),
//! );
//!
//! let services = ServiceManager::builder()
//!     .service(ServiceDefinition::builder::<()>("calc").event("calc.add.v1", add).build()?)
//!     .build()?;
//!
//! let transit = Transit::start(
//!     &TransitConfig::new("com.acme", "calc.backend"),
//!     Arc::new(SchemaStore::with_schemas(schemas)),
//!     services,
//!     Arc::new(InternalTransporter::new()),
//! )
//! .await?;
//!
//! let event = transit.publish("calc.add.v1", serde_json::json!({"a": 1, "b": 2})).await?;
//! assert_eq!(event.event_type(), "com.acme.calc.add.v1");
//!
//! transit.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transporters
//!
//! - **internal** - In-process loop-back for tests and single-process use
//! - **pubsub** - Google Cloud Pub/Sub over its REST API
//! - **jetstream** - NATS JetStream durable pull consumers
//!
//! ## Architecture
//!
//! - **Naming** - domain/type/source validation and consumer names
//! - **SchemaStore** + **Serializer** - two-stage validation and encoding
//! - **Transporter** trait: the contract every backend implements
//! - **ServiceManager** - immutable registry and per-message fan-out
//! - **Transit** - publish/receive coordinator with a bounded worker pool
//! - **PullSubscriber** - validating batch pull over a durable consumer

pub mod config;
pub mod error;
pub mod event;
pub mod exception;
pub mod naming;
pub mod pool;
pub mod pull_subscriber;
pub mod schema;
pub mod serializer;
pub mod service;
pub mod service_manager;
pub mod telemetry;
pub mod testing;
pub mod transit;
pub mod transporter;

// Re-export core types
pub use config::{PoolConfig, TransitConfig};
pub use error::{Result, TransitError};
pub use event::{ClientData, Event, EventBuilder, TraceLink};
pub use exception::{
    ExceptionHandler, FailureKind, HandlerFailure, LoggingExceptionHandler,
    MemoryExceptionHandler,
};
pub use naming::Naming;
pub use pool::WorkerPool;
pub use pull_subscriber::{FetchParams, PullSource, PullSubscriber, ReceivedEvent};
pub use schema::{KvSchemaBackend, MemorySchemaBackend, SchemaBackend, SchemaStore};
pub use serializer::Serializer;
pub use service::{Context, ServiceDefinition};
pub use service_manager::ServiceManager;
pub use transit::Transit;
pub use transporter::{Acknowledger, Envelope, Headers, Transporter, TransporterConfig};

// Re-export transporters for convenience
pub use transporter::internal::InternalTransporter;
pub use transporter::jetstream::{JetStreamClient, JetStreamConfig, JetStreamTransporter};
pub use transporter::pubsub::{PubSubConfig, PubSubTransporter};
