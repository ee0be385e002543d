//! Two-stage event validation and JSON encoding
//!
//! Every event is checked twice, on publish and again on receive:
//!
//! 1. **Envelope**: the bundled CloudEvents v1.0 schema (no network).
//! 2. **Domain**: the schema registered for the domain-trimmed `type`,
//!    applied to the whole envelope (it embeds its own `data` schema).

use crate::error::{Result, TransitError};
use crate::event::Event;
use crate::naming::Naming;
use crate::schema::SchemaStore;
use jsonschema::JSONSchema;
use std::sync::{Arc, OnceLock};

const CLOUD_EVENT_SCHEMA: &str = include_str!("cloud-event-schema.json");

fn cloud_event_validator() -> Result<&'static JSONSchema> {
    static VALIDATOR: OnceLock<std::result::Result<JSONSchema, String>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema: serde_json::Value =
                serde_json::from_str(CLOUD_EVENT_SCHEMA).map_err(|e| e.to_string())?;
            JSONSchema::compile(&schema).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| TransitError::Schema(format!("Bundled CloudEvents schema is invalid: {}", e)))
}

/// JSON serializer with CloudEvents + domain schema validation
#[derive(Clone)]
pub struct Serializer {
    naming: Naming,
    schemas: Arc<SchemaStore>,
}

impl Serializer {
    pub fn new(naming: Naming, schemas: Arc<SchemaStore>) -> Self {
        Self { naming, schemas }
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn schema_store(&self) -> &SchemaStore {
        &self.schemas
    }

    /// Validate an event and encode it as canonical JSON bytes
    pub fn serialize(&self, event: &Event) -> Result<Vec<u8>> {
        let value = event.to_value()?;
        self.validate(&value)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Decode and validate raw bytes into an [`Event`]
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Event> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|_| {
            TransitError::Validation(format!(
                "Unable to decode the following message:\n{}",
                String::from_utf8_lossy(bytes)
            ))
        })?;

        self.validate(&value)?;

        let event: Event = serde_json::from_value(value).map_err(|e| {
            TransitError::Validation(format!("Message does not form a valid event: {}", e))
        })?;

        if !crate::event::is_supported_version(event.specversion()) {
            return Err(TransitError::Validation(format!(
                "Unsupported version: '{}'",
                event.specversion()
            )));
        }

        Ok(event)
    }

    /// Run both validation stages against a JSON event object
    pub fn validate(&self, event: &serde_json::Value) -> Result<()> {
        validate_against(cloud_event_validator()?, event)?;

        let event_type = event
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                TransitError::Validation(format!(
                    "Could not find a `type` in message {}\nEvery event must have a `type`",
                    event
                ))
            })?;

        let validator = self
            .schemas
            .validator(self.naming.trim_domain_prefix(event_type))?;
        validate_against(&validator, event)
    }
}

/// Validate and collect every violation into a single error
fn validate_against(schema: &JSONSchema, event: &serde_json::Value) -> Result<()> {
    let violations: Vec<String> = match schema.validate(event) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|error| {
                let schema_path = error.schema_path.to_string();
                let keyword = schema_path.rsplit('/').next().unwrap_or_default().to_string();
                format!(
                    "Property: `{}` - {} - {}",
                    error.instance_path, keyword, error
                )
            })
            .collect(),
    };

    let id = event.get("id").and_then(|v| v.as_str()).unwrap_or("<missing>");
    let source = event
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("<missing>");

    let mut lines = vec![
        format!("event {} from {} is not valid", id, source),
        format!("Event data: {}", event),
    ];
    lines.extend(violations);
    Err(TransitError::Validation(lines.join("\n")))
}
