//! In-process JetStream stand-in for tests
//!
//! `MemoryJetStream` keeps streams, durable consumers and message logs in
//! memory and implements [`PullSource`], so pull-consumer code can be
//! exercised without a NATS server. Every acknowledgement is recorded per
//! consumer for assertions.

use crate::error::{Result, TransitError};
use crate::naming::subject_matches;
use crate::pull_subscriber::PullSource;
use crate::transporter::{Acknowledger, Envelope, Headers};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    data: Bytes,
    headers: Headers,
}

#[derive(Debug, Default)]
struct ConsumerState {
    filter: Option<String>,
    /// Index of the next never-delivered message in the stream log
    cursor: usize,
    redeliver: VecDeque<u64>,
    acked: BTreeSet<u64>,
    naked: Vec<u64>,
    terminated: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct StreamState {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Debug, Default)]
struct State {
    streams: BTreeMap<String, StreamState>,
    last_sequence: u64,
}

/// In-memory stream log with durable pull consumers
#[derive(Clone, Default)]
pub struct MemoryJetStream {
    state: Arc<Mutex<State>>,
}

impl MemoryJetStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        lock_state(&self.state)
    }

    /// Create (or replace the subjects of) a stream
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        if let Ok(mut state) = self.lock() {
            state.streams.entry(name.to_string()).or_default().subjects =
                subjects.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Add a durable consumer that receives every message on the stream
    pub fn add_consumer(&self, stream: &str, name: &str) {
        self.add_consumer_with_filter(stream, name, None);
    }

    /// Add a durable consumer restricted to subjects matching `filter`
    pub fn add_consumer_with_filter(&self, stream: &str, name: &str, filter: Option<&str>) {
        if let Ok(mut state) = self.lock() {
            if let Some(stream) = state.streams.get_mut(stream) {
                stream.consumers.insert(
                    name.to_string(),
                    ConsumerState {
                        filter: filter.map(str::to_string),
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Append raw bytes to the stream capturing `subject`, returning the sequence
    pub fn publish_raw(&self, subject: &str, data: impl Into<Bytes>) -> Result<u64> {
        self.publish_with_headers(subject, data, Headers::new())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        data: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let stream_name = find_stream(&state, subject)?;

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        if let Some(stream) = state.streams.get_mut(&stream_name) {
            stream.messages.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                data: data.into(),
                headers,
            });
        }
        Ok(sequence)
    }

    /// Sequences acknowledged through `consumer`
    pub fn acked(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.read_consumer(stream, consumer, |c| c.acked.iter().copied().collect())
    }

    /// Sequences terminated through `consumer`
    pub fn terminated(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.read_consumer(stream, consumer, |c| c.terminated.iter().copied().collect())
    }

    /// Sequences negatively acknowledged through `consumer`, in order
    pub fn naked(&self, stream: &str, consumer: &str) -> Vec<u64> {
        self.read_consumer(stream, consumer, |c| c.naked.clone())
    }

    fn read_consumer<T: Default>(
        &self,
        stream: &str,
        consumer: &str,
        read: impl FnOnce(&ConsumerState) -> T,
    ) -> T {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .streams
                    .get(stream)
                    .and_then(|s| s.consumers.get(consumer))
                    .map(read)
            })
            .unwrap_or_default()
    }
}

fn lock_state(state: &Mutex<State>) -> Result<MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|e| TransitError::Provider(format!("Memory JetStream lock poisoned: {}", e)))
}

fn find_stream(state: &State, subject: &str) -> Result<String> {
    state
        .streams
        .iter()
        .find(|(_, stream)| stream.subjects.iter().any(|p| subject_matches(subject, p)))
        .map(|(name, _)| name.clone())
        .ok_or_else(|| TransitError::TopicNotFound(format!("No stream captures '{}'", subject)))
}

enum AckAction {
    Ack,
    Nak,
    Term,
}

struct MemoryAcknowledger {
    state: Arc<Mutex<State>>,
    stream: String,
    consumer: String,
    sequence: u64,
}

impl MemoryAcknowledger {
    fn record(&self, action: AckAction) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        let consumer = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.consumer))
            .ok_or_else(|| TransitError::Ack(format!("Consumer '{}' is gone", self.consumer)))?;

        match action {
            AckAction::Ack => {
                consumer.acked.insert(self.sequence);
            }
            AckAction::Nak => {
                consumer.naked.push(self.sequence);
                consumer.redeliver.push_back(self.sequence);
            }
            AckAction::Term => {
                consumer.terminated.insert(self.sequence);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.record(AckAction::Ack)
    }

    async fn nak(&self) -> Result<()> {
        self.record(AckAction::Nak)
    }

    async fn term(&self) -> Result<()> {
        self.record(AckAction::Term)
    }
}

#[async_trait]
impl PullSource for MemoryJetStream {
    async fn stream_by_subject(&self, subject: &str) -> Result<String> {
        find_stream(&*self.lock()?, subject)
    }

    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .streams
            .get(stream)
            .map_or(false, |s| s.consumers.contains_key(consumer)))
    }

    /// Returns immediately with whatever is available; `timeout` is unused
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        _timeout: Duration,
    ) -> Result<Vec<Envelope>> {
        let mut state = self.lock()?;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| TransitError::TopicNotFound(format!("Stream '{}' does not exist", stream)))?;
        let StreamState {
            messages,
            consumers,
            ..
        } = stream_state;
        let consumer_state = consumers.get_mut(consumer).ok_or_else(|| {
            TransitError::TopicNotFound(format!("Consumer '{}' does not exist", consumer))
        })?;

        let mut picked: Vec<StoredMessage> = Vec::with_capacity(batch);
        while picked.len() < batch {
            if let Some(sequence) = consumer_state.redeliver.pop_front() {
                if let Some(msg) = messages.iter().find(|m| m.sequence == sequence) {
                    picked.push(msg.clone());
                }
                continue;
            }

            let Some(msg) = messages.get(consumer_state.cursor) else {
                break;
            };
            consumer_state.cursor += 1;

            let wanted = consumer_state
                .filter
                .as_deref()
                .map_or(true, |f| subject_matches(&msg.subject, f));
            if wanted {
                picked.push(msg.clone());
            }
        }
        drop(state);

        Ok(picked
            .into_iter()
            .map(|msg| {
                Envelope::new(msg.subject.clone(), msg.data)
                    .with_headers(msg.headers)
                    .with_acknowledger(Arc::new(MemoryAcknowledger {
                        state: self.state.clone(),
                        stream: stream.to_string(),
                        consumer: consumer.to_string(),
                        sequence: msg.sequence,
                    }))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_lookup_by_subject() {
        let js = MemoryJetStream::new();
        js.add_stream("CALC", &["calc.>"]);

        assert_eq!(js.stream_by_subject("calc.add.v1").await.unwrap(), "CALC");
        assert!(matches!(
            js.stream_by_subject("orders.placed.v1").await,
            Err(TransitError::TopicNotFound(_))
        ));
        assert!(js.publish_raw("orders.placed.v1", b"{}".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_advances_cursor() {
        let js = MemoryJetStream::new();
        js.add_stream("CALC", &["calc.>"]);
        js.add_consumer("CALC", "worker");
        for i in 0..3 {
            js.publish_raw("calc.add.v1", format!("{}", i).into_bytes()).unwrap();
        }

        let first = js.fetch("CALC", "worker", 2, Duration::ZERO).await.unwrap();
        let second = js.fetch("CALC", "worker", 2, Duration::ZERO).await.unwrap();
        let third = js.fetch("CALC", "worker", 2, Duration::ZERO).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert_eq!(&second[0].data[..], b"2");
    }

    #[tokio::test]
    async fn test_ack_nak_term_recorded() {
        let js = MemoryJetStream::new();
        js.add_stream("CALC", &["calc.>"]);
        js.add_consumer("CALC", "worker");
        for _ in 0..3 {
            js.publish_raw("calc.add.v1", b"{}".to_vec()).unwrap();
        }

        let batch = js.fetch("CALC", "worker", 3, Duration::ZERO).await.unwrap();
        batch[0].acknowledge().await.unwrap();
        batch[1].nak().await.unwrap();
        batch[2].term().await.unwrap();

        assert_eq!(js.acked("CALC", "worker"), vec![1]);
        assert_eq!(js.naked("CALC", "worker"), vec![2]);
        assert_eq!(js.terminated("CALC", "worker"), vec![3]);

        // Nak'd message comes back, terminated one does not
        let again = js.fetch("CALC", "worker", 5, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_consumer() {
        let js = MemoryJetStream::new();
        js.add_stream("CALC", &["calc.>"]);
        js.add_consumer_with_filter("CALC", "adds", Some("calc.add.v1"));
        js.publish_raw("calc.add.v1", b"1".to_vec()).unwrap();
        js.publish_raw("calc.sub.v1", b"2".to_vec()).unwrap();

        let batch = js.fetch("CALC", "adds", 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "calc.add.v1");
    }

    #[tokio::test]
    async fn test_unknown_consumer() {
        let js = MemoryJetStream::new();
        js.add_stream("CALC", &["calc.>"]);
        assert!(!js.consumer_exists("CALC", "nobody").await.unwrap());
        assert!(js.fetch("CALC", "nobody", 1, Duration::ZERO).await.is_err());
    }
}
