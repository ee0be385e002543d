//! CloudEvents-shaped event value
//!
//! All types serialize to the lowercase CloudEvents attribute names used on
//! the wire (`specversion`, `datacontenttype`, ...).

use crate::error::{Result, TransitError};
use crate::naming::Naming;
use serde::{Deserialize, Serialize};

/// CloudEvents spec version stamped on every event
pub const CLOUD_EVENT_VERSION: &str = "1.0";

/// Default content type for event data
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// One causal link in an event's `polyntrace`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLink {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: String,
}

/// Metadata about the client that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(default)]
    pub clientlang: String,
    #[serde(default)]
    pub clientlangversion: String,
    #[serde(default)]
    pub clientversion: String,
}

impl ClientData {
    fn current() -> Self {
        Self {
            clientlang: "rust".to_string(),
            clientlangversion: env!("CARGO_PKG_RUST_VERSION").to_string(),
            clientversion: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A single domain-qualified event
///
/// Fields are read-only once built. Use [`Event::builder`] to construct one
/// from raw (unqualified) inputs; the builder qualifies `type` and `source`
/// against a [`Naming`] context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    specversion: String,
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    time: String,
    datacontenttype: String,
    data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    polyntrace: Vec<TraceLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    polyndata: Option<ClientData>,
}

impl Event {
    /// Build an event with a generated id and the current time
    pub fn new(naming: &Naming, event_type: &str, data: serde_json::Value) -> Result<Self> {
        Self::builder(event_type, data).build(naming)
    }

    /// Start building an event from an unqualified type and its data
    pub fn builder(event_type: impl Into<String>, data: serde_json::Value) -> EventBuilder {
        EventBuilder {
            event_type: event_type.into(),
            data,
            id: None,
            source: None,
            time: None,
            specversion: None,
            datacontenttype: None,
            polyntrace: Vec::new(),
        }
    }

    pub fn specversion(&self) -> &str {
        &self.specversion
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fully qualified event type
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Fully qualified, colon separated source
    pub fn source(&self) -> &str {
        &self.source
    }

    /// ISO-8601 UTC creation time
    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn datacontenttype(&self) -> &str {
        &self.datacontenttype
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Consume the event and keep only its data
    pub fn into_data(self) -> serde_json::Value {
        self.data
    }

    pub fn polyntrace(&self) -> &[TraceLink] {
        &self.polyntrace
    }

    pub fn polyndata(&self) -> Option<&ClientData> {
        self.polyndata.as_ref()
    }

    /// This event as a causal link for a follow-up event
    pub fn as_trace_link(&self) -> TraceLink {
        TraceLink {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            time: self.time.clone(),
        }
    }

    /// JSON object representation used for schema validation
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builder for [`Event`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    data: serde_json::Value,
    id: Option<String>,
    source: Option<String>,
    time: Option<String>,
    specversion: Option<String>,
    datacontenttype: Option<String>,
    polyntrace: Vec<TraceLink>,
}

impl EventBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Source segment appended after the configured source root
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    pub fn specversion(mut self, version: impl Into<String>) -> Self {
        self.specversion = Some(version.into());
        self
    }

    pub fn datacontenttype(mut self, content_type: impl Into<String>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self
    }

    /// Record `parent` (and its own causal chain) as the cause of this event
    pub fn triggered_by(mut self, parent: &Event) -> Self {
        self.polyntrace = parent.polyntrace.clone();
        self.polyntrace.push(parent.as_trace_link());
        self
    }

    /// Qualify type and source and produce the event
    pub fn build(self, naming: &Naming) -> Result<Event> {
        let specversion = self
            .specversion
            .unwrap_or_else(|| CLOUD_EVENT_VERSION.to_string());
        if !is_supported_version(&specversion) {
            return Err(TransitError::Validation(format!(
                "Unsupported version: '{}'",
                specversion
            )));
        }

        Ok(Event {
            specversion,
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            event_type: naming.full_type(&self.event_type)?,
            source: naming.full_source(self.source.as_deref())?,
            time: self.time.unwrap_or_else(now_iso8601),
            datacontenttype: self
                .datacontenttype
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            data: self.data,
            polyntrace: self.polyntrace,
            polyndata: Some(ClientData::current()),
        })
    }
}

/// `1.x` versions are accepted
pub(crate) fn is_supported_version(version: &str) -> bool {
    let mut parts = version.split('.');
    parts.next() == Some("1") && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> Naming {
        Naming::new("com.test", "user.backend").unwrap()
    }

    #[test]
    fn test_event_creation_qualifies_names() {
        let event = Event::new(&naming(), "calc.mult.v1", serde_json::json!({"a": 1, "b": 2}))
            .unwrap();

        assert_eq!(event.event_type(), "com.test.calc.mult.v1");
        assert_eq!(event.source(), "com:test:user:backend");
        assert_eq!(event.specversion(), "1.0");
        assert_eq!(event.datacontenttype(), "application/json");
        assert!(uuid::Uuid::parse_str(event.id()).is_ok());
        assert!(event.time().ends_with('Z'));
        assert_eq!(event.polyndata().unwrap().clientlang, "rust");
    }

    #[test]
    fn test_builder_overrides() {
        let event = Event::builder("user.created.v1", serde_json::json!({}))
            .id("evt-1")
            .source("orders")
            .time("2024-01-01T00:00:00Z")
            .build(&naming())
            .unwrap();

        assert_eq!(event.id(), "evt-1");
        assert_eq!(event.source(), "com:test:user:backend:orders");
        assert_eq!(event.time(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_invalid_type_rejected() {
        let err = Event::new(&naming(), "user:created", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, TransitError::Validation(_)));
    }

    #[test]
    fn test_unsupported_specversion() {
        let err = Event::builder("user.created.v1", serde_json::json!({}))
            .specversion("2.0")
            .build(&naming())
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported version"));

        assert!(is_supported_version("1.0"));
        assert!(is_supported_version("1.2"));
        assert!(!is_supported_version("0.3"));
        assert!(!is_supported_version("1.x"));
    }

    #[test]
    fn test_triggered_by_carries_chain() {
        let n = naming();
        let first = Event::new(&n, "order.placed.v1", serde_json::json!({})).unwrap();
        let second = Event::builder("payment.taken.v1", serde_json::json!({}))
            .triggered_by(&first)
            .build(&n)
            .unwrap();
        let third = Event::builder("order.shipped.v1", serde_json::json!({}))
            .triggered_by(&second)
            .build(&n)
            .unwrap();

        let ids: Vec<&str> = third.polyntrace().iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(third.polyntrace()[0].event_type, "com.test.order.placed.v1");
    }

    #[test]
    fn test_wire_field_names() {
        let event = Event::new(&naming(), "calc.mult.v1", serde_json::json!({"a": 1})).unwrap();
        let json = serde_json::to_value(&event).unwrap();

        for field in ["id", "source", "specversion", "type", "time", "datacontenttype", "data"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        // Empty trace is not written
        assert!(json.get("polyntrace").is_none());
        assert_eq!(json["polyndata"]["clientlang"], "rust");
    }
}
