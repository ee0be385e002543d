//! Handler failure reporting
//!
//! A failing or panicking handler never propagates past its own invocation.
//! The failure is described as a `HandlerFailure` and passed to the
//! configured `ExceptionHandler`. The message is left unacknowledged, so
//! at-least-once backends redeliver it according to their own policy.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How a handler invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The handler returned an error
    Error,
    /// The handler panicked
    Panicked,
}

/// One failed handler invocation
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub service: String,
    pub topic: String,
    pub event_id: String,
    pub event_type: String,
    pub kind: FailureKind,
    pub reason: String,
    /// Unix timestamp in milliseconds
    pub failed_at: u64,
}

impl HandlerFailure {
    pub fn new(
        service: impl Into<String>,
        topic: impl Into<String>,
        event: &crate::event::Event,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            topic: topic.into(),
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            kind,
            reason: reason.into(),
            failed_at: now_millis(),
        }
    }
}

/// Receives failures raised at the service dispatch boundary
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    async fn handle_receive_exception(&self, failure: HandlerFailure) -> Result<()>;
}

/// Logs each failure and carries on
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

#[async_trait]
impl ExceptionHandler for LoggingExceptionHandler {
    async fn handle_receive_exception(&self, failure: HandlerFailure) -> Result<()> {
        tracing::error!(
            service = %failure.service,
            topic = %failure.topic,
            event_id = %failure.event_id,
            kind = ?failure.kind,
            reason = %failure.reason,
            "Event handler failed"
        );
        Ok(())
    }
}

/// Keeps the most recent failures in memory, for tests and diagnostics
pub struct MemoryExceptionHandler {
    failures: Arc<RwLock<Vec<HandlerFailure>>>,
    max_failures: usize,
}

impl MemoryExceptionHandler {
    /// `max_failures == 0` keeps everything
    pub fn new(max_failures: usize) -> Self {
        Self {
            failures: Arc::new(RwLock::new(Vec::new())),
            max_failures,
        }
    }

    pub async fn count(&self) -> usize {
        self.failures.read().await.len()
    }

    /// Most recent first
    pub async fn list(&self, limit: usize) -> Vec<HandlerFailure> {
        let failures = self.failures.read().await;
        failures.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryExceptionHandler {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl ExceptionHandler for MemoryExceptionHandler {
    async fn handle_receive_exception(&self, failure: HandlerFailure) -> Result<()> {
        tracing::warn!(
            service = %failure.service,
            event_id = %failure.event_id,
            reason = %failure.reason,
            "Handler failure recorded"
        );

        let mut failures = self.failures.write().await;
        failures.push(failure);

        if self.max_failures > 0 && failures.len() > self.max_failures {
            let drain_count = failures.len() - self.max_failures;
            failures.drain(..drain_count);
        }

        Ok(())
    }
}

/// Best-effort text for a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
