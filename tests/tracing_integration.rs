//! W3C trace propagation over the in-process transporter
//!
//! Installs a process-wide OpenTelemetry tracer provider, so these tests
//! live in their own binary.

use a3s_transit::{
    Context, Event, InternalTransporter, SchemaStore, ServiceDefinition, ServiceManager, Transit,
    TransitConfig,
};
use opentelemetry_sdk::trace::TracerProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        opentelemetry::global::set_tracer_provider(TracerProvider::builder().build());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("a3s_transit=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn schemas() -> Arc<SchemaStore> {
    let operands = serde_json::json!({
        "type": "object",
        "properties": {
            "data": {
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }
        }
    });
    let mut schemas = HashMap::new();
    for t in ["calc.add.v1", "calc.total.v1"] {
        schemas.insert(t.to_string(), operands.clone());
    }
    Arc::new(SchemaStore::with_schemas(schemas))
}

fn config() -> TransitConfig {
    TransitConfig::new("com.test", "user.backend")
}

/// Trace id field of a `traceparent` header
fn trace_id(traceparent: &str) -> &str {
    traceparent.split('-').nth(1).unwrap_or_default()
}

/// Poll `seen` until it holds `count` entries or two seconds pass
async fn wait_for(seen: &Mutex<Vec<Option<String>>>, count: usize) -> Vec<Option<String>> {
    for _ in 0..200 {
        let current = seen.lock().unwrap().clone();
        if current.len() >= count {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    seen.lock().unwrap().clone()
}

#[tokio::test]
async fn test_handler_sees_traceparent() {
    static SEEN: Mutex<Vec<Option<String>>> = Mutex::new(Vec::new());

    async fn record(_: (), ctx: Context) -> anyhow::Result<()> {
        SEEN.lock()
            .unwrap()
            .push(ctx.header("traceparent").map(str::to_string));
        Ok(())
    }

    init_tracing();
    let services = ServiceManager::builder()
        .service(
            ServiceDefinition::builder::<()>("calc")
                .event("calc.add.v1", record)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let transit = Transit::start(
        &config().with_trace_headers(true),
        schemas(),
        services,
        Arc::new(InternalTransporter::new()),
    )
    .await
    .unwrap();

    transit
        .publish("calc.add.v1", serde_json::json!({"a": 1, "b": 2}))
        .await
        .unwrap();

    let seen = wait_for(&SEEN, 1).await;
    transit.shutdown().await.unwrap();

    assert_eq!(seen.len(), 1);
    let traceparent = seen[0].as_deref().expect("no traceparent header");
    assert_eq!(traceparent.split('-').count(), 4);
    assert_ne!(trace_id(traceparent), "0".repeat(32));
}

#[tokio::test]
async fn test_follow_up_publish_continues_trace() {
    static TRANSIT: OnceLock<Arc<Transit>> = OnceLock::new();
    static SEEN: Mutex<Vec<Option<String>>> = Mutex::new(Vec::new());

    async fn relay(_: (), ctx: Context) -> anyhow::Result<()> {
        SEEN.lock()
            .unwrap()
            .push(ctx.header("traceparent").map(str::to_string));

        let transit = TRANSIT.get().expect("transit started");
        let total = Event::builder("calc.total.v1", ctx.data().clone())
            .triggered_by(ctx.event())
            .build(transit.serializer().naming())?;
        transit.publish_event(&total).await?;
        Ok(())
    }

    async fn total(_: (), ctx: Context) -> anyhow::Result<()> {
        SEEN.lock()
            .unwrap()
            .push(ctx.header("traceparent").map(str::to_string));
        Ok(())
    }

    init_tracing();
    let services = ServiceManager::builder()
        .service(
            ServiceDefinition::builder::<()>("relay")
                .event("calc.add.v1", relay)
                .build()
                .unwrap(),
        )
        .service(
            ServiceDefinition::builder::<()>("totals")
                .event("calc.total.v1", total)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let transit = Transit::start(
        &config().with_trace_headers(true),
        schemas(),
        services,
        Arc::new(InternalTransporter::new()),
    )
    .await
    .unwrap();
    let transit = TRANSIT.get_or_init(|| Arc::new(transit)).clone();

    transit
        .publish("calc.add.v1", serde_json::json!({"a": 1, "b": 2}))
        .await
        .unwrap();

    let seen = wait_for(&SEEN, 2).await;
    transit.shutdown().await.unwrap();

    assert_eq!(seen.len(), 2);
    let first = seen[0].as_deref().expect("no traceparent on the first hop");
    let second = seen[1].as_deref().expect("no traceparent on the follow-up");
    assert_eq!(trace_id(first), trace_id(second));
    assert_ne!(first, second, "follow-up must be sent from its own span");
}

#[tokio::test]
async fn test_trace_headers_disabled() {
    static SEEN: Mutex<Vec<Option<String>>> = Mutex::new(Vec::new());

    async fn record(_: (), ctx: Context) -> anyhow::Result<()> {
        SEEN.lock()
            .unwrap()
            .push(ctx.header("traceparent").map(str::to_string));
        Ok(())
    }

    init_tracing();
    let services = ServiceManager::builder()
        .service(
            ServiceDefinition::builder::<()>("calc")
                .event("calc.add.v1", record)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let transit = Transit::start(
        &config().with_trace_headers(false),
        schemas(),
        services,
        Arc::new(InternalTransporter::new()),
    )
    .await
    .unwrap();

    transit
        .publish("calc.add.v1", serde_json::json!({"a": 1, "b": 2}))
        .await
        .unwrap();

    let seen = wait_for(&SEEN, 1).await;
    transit.shutdown().await.unwrap();

    assert_eq!(seen, vec![None]);
}
