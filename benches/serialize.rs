//! Performance benchmarks for a3s-transit
//!
//! Run with: cargo bench

use a3s_transit::{
    Event, InternalTransporter, Naming, SchemaStore, Serializer, ServiceManager, Transit,
    TransitConfig,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::sync::Arc;

fn schemas() -> Arc<SchemaStore> {
    let mut schemas = HashMap::new();
    schemas.insert(
        "market.rate.changed.v1".to_string(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "object",
                    "properties": {
                        "rate": {"type": "number"},
                        "currency": {"type": "string"}
                    },
                    "required": ["rate", "currency"]
                }
            }
        }),
    );
    Arc::new(SchemaStore::with_schemas(schemas))
}

fn naming() -> Naming {
    Naming::new("com.bench", "market.feed").unwrap()
}

fn payload() -> serde_json::Value {
    serde_json::json!({"rate": 7.35, "currency": "USD/CNY"})
}

fn bench_event_creation(c: &mut Criterion) {
    let naming = naming();

    c.bench_function("Event::new", |b| {
        b.iter(|| Event::new(&naming, "market.rate.changed.v1", payload()).unwrap());
    });

    let cause = Event::new(&naming, "market.rate.changed.v1", payload()).unwrap();
    c.bench_function("Event::builder triggered_by", |b| {
        b.iter(|| {
            Event::builder("market.rate.changed.v1", payload())
                .triggered_by(&cause)
                .build(&naming)
                .unwrap()
        });
    });
}

fn bench_serializer(c: &mut Criterion) {
    let serializer = Serializer::new(naming(), schemas());
    let event = Event::new(serializer.naming(), "market.rate.changed.v1", payload()).unwrap();

    c.bench_function("Serializer serialize", |b| {
        b.iter(|| serializer.serialize(&event).unwrap());
    });

    let bytes = serializer.serialize(&event).unwrap();
    c.bench_function("Serializer deserialize", |b| {
        b.iter(|| serializer.deserialize(&bytes).unwrap());
    });

    let invalid = serde_json::json!({"rate": "high"});
    c.bench_function("Serializer reject invalid data", |b| {
        b.iter(|| {
            let event =
                Event::new(serializer.naming(), "market.rate.changed.v1", invalid.clone()).unwrap();
            serializer.serialize(&event).unwrap_err()
        });
    });
}

fn bench_internal_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let transit = rt.block_on(async {
        Transit::start(
            &TransitConfig::new("com.bench", "market.feed"),
            schemas(),
            ServiceManager::builder().build().unwrap(),
            Arc::new(InternalTransporter::new()),
        )
        .await
        .unwrap()
    });

    let publisher = &transit;
    let mut group = c.benchmark_group("internal_publish");
    for count in [10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                for _ in 0..count {
                    publisher
                        .publish("market.rate.changed.v1", payload())
                        .await
                        .unwrap();
                }
            });
        });
    }
    group.finish();

    rt.block_on(transit.shutdown()).unwrap();
}

criterion_group!(
    benches,
    bench_event_creation,
    bench_serializer,
    bench_internal_publish
);
criterion_main!(benches);
