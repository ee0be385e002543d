//! OpenTelemetry spans and W3C trace-context headers
//!
//! Spans are started on the global tracer. Without an installed
//! `TracerProvider` they are no-ops and nothing is injected.

use crate::transporter::{Headers, TRACEPARENT_HEADER};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context};
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Instrumentation scope name on the global tracer
pub const TRACER_NAME: &str = "a3s-transit";

/// Producer span `<subject> send`, child of the current context
pub(crate) fn send_context(subject: &str) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let parent = Context::current();
    let span = tracer
        .span_builder(format!("{} send", subject))
        .with_kind(SpanKind::Producer)
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

/// Consumer span `<topic> <operation>`, child of the context carried in
/// `headers` (or of the current context when there is none)
pub(crate) fn receive_context(headers: &Headers, topic: &str, operation: &str) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let parent = extract(headers);
    let span = tracer
        .span_builder(format!("{} {}", topic, operation))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

/// Write `context` into `headers` as a `traceparent`
pub(crate) fn inject(context: &Context, headers: &mut Headers) {
    TraceContextPropagator::new().inject_context(context, headers);
}

fn extract(headers: &Headers) -> Context {
    if headers.contains_key(TRACEPARENT_HEADER) {
        TraceContextPropagator::new().extract(headers)
    } else {
        Context::current()
    }
}

/// Trace id carried by an inbound `traceparent` header, if any
pub(crate) fn remote_trace_id(headers: &Headers) -> Option<String> {
    if !headers.contains_key(TRACEPARENT_HEADER) {
        return None;
    }

    let context = TraceContextPropagator::new().extract(headers);
    let span_context = context.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// End the span in `context`, marking it failed on error
pub(crate) fn finish<T, E: std::fmt::Display>(context: &Context, result: &Result<T, E>) {
    let span = context.span();
    if let Err(e) = result {
        span.set_status(Status::error(e.to_string()));
    }
    span.end();
}
