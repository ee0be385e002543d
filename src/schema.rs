//! Schema store: cached lookup of per-type JSON Schemas
//!
//! Schemas live in a durable backend (a JetStream key-value bucket in
//! production). A `SchemaStore` loads the whole keyspace once and serves
//! every lookup from its in-process cache afterwards. The cache is never
//! invalidated; reconnect to observe schemas changed by other processes.
//!
//! Compiled validators are cached next to the documents. They are built on
//! first use and replaced whenever `save` changes a schema.

use crate::error::{Result, TransitError};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use jsonschema::JSONSchema;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Default key-value bucket holding event schemas
pub const DEFAULT_STORE_NAME: &str = "POLYN_SCHEMAS";

/// Durable storage for raw schema documents keyed by domain-trimmed type
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Load every stored schema (type → raw JSON document)
    async fn load_all(&self) -> Result<HashMap<String, String>>;

    /// Persist a raw JSON schema document
    async fn put(&self, event_type: &str, document: &str) -> Result<()>;
}

/// In-memory schema backend for development and testing
#[derive(Default)]
pub struct MemorySchemaBackend {
    documents: RwLock<HashMap<String, String>>,
}

impl MemorySchemaBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaBackend for MemorySchemaBackend {
    async fn load_all(&self) -> Result<HashMap<String, String>> {
        let documents = self.documents.read().map_err(|e| {
            TransitError::Provider(format!("Schema backend lock poisoned: {}", e))
        })?;
        Ok(documents.clone())
    }

    async fn put(&self, event_type: &str, document: &str) -> Result<()> {
        let mut documents = self.documents.write().map_err(|e| {
            TransitError::Provider(format!("Schema backend lock poisoned: {}", e))
        })?;
        documents.insert(event_type.to_string(), document.to_string());
        Ok(())
    }
}

/// Schema backend on a NATS JetStream key-value bucket
pub struct KvSchemaBackend {
    store: jetstream::kv::Store,
    bucket: String,
}

impl KvSchemaBackend {
    /// Open an existing bucket; a missing bucket is a provisioning gap
    pub async fn open(context: &jetstream::Context, bucket: &str) -> Result<Self> {
        let store = context.get_key_value(bucket).await.map_err(|e| {
            TransitError::Schema(format!(
                "The schema store '{}' has not been set up on your NATS server: {}",
                bucket, e
            ))
        })?;

        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }
}

#[async_trait]
impl SchemaBackend for KvSchemaBackend {
    async fn load_all(&self) -> Result<HashMap<String, String>> {
        let mut keys = self.store.keys().await.map_err(|e| {
            TransitError::Schema(format!(
                "Failed to list keys in schema store '{}': {}",
                self.bucket, e
            ))
        })?;

        // The key listing terminates on its own once the bucket is exhausted
        let mut documents = HashMap::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| TransitError::Provider(e.to_string()))?;
            let value = self
                .store
                .get(&key)
                .await
                .map_err(|e| TransitError::Provider(e.to_string()))?;

            match value {
                Some(bytes) if !bytes.is_empty() => {
                    let document = String::from_utf8(bytes.to_vec()).map_err(|e| {
                        TransitError::Schema(format!("Schema for '{}' is not UTF-8: {}", key, e))
                    })?;
                    documents.insert(key, document);
                }
                _ => {}
            }
        }

        tracing::debug!(bucket = %self.bucket, count = documents.len(), "Schemas loaded");
        Ok(documents)
    }

    async fn put(&self, event_type: &str, document: &str) -> Result<()> {
        self.store
            .put(event_type, document.to_string().into())
            .await
            .map_err(|e| TransitError::Provider(format!(
                "Failed to save schema '{}': {}",
                event_type, e
            )))?;
        Ok(())
    }
}

/// Cached view over a [`SchemaBackend`]
pub struct SchemaStore {
    backend: Option<Arc<dyn SchemaBackend>>,
    schemas: RwLock<HashMap<String, Arc<serde_json::Value>>>,
    validators: RwLock<HashMap<String, Arc<JSONSchema>>>,
}

impl SchemaStore {
    /// Bulk-load every schema from `backend` into a new store
    pub async fn load(backend: Arc<dyn SchemaBackend>) -> Result<Self> {
        let documents = backend.load_all().await?;
        let mut schemas = HashMap::with_capacity(documents.len());

        for (event_type, document) in documents {
            match serde_json::from_str::<serde_json::Value>(&document) {
                Ok(schema) => {
                    schemas.insert(event_type, Arc::new(schema));
                }
                Err(e) => {
                    tracing::warn!(
                        event_type = %event_type,
                        error = %e,
                        "Skipping stored schema that is not valid JSON"
                    );
                }
            }
        }

        tracing::info!(count = schemas.len(), "Schema store loaded");
        Ok(Self {
            backend: Some(backend),
            schemas: RwLock::new(schemas),
            validators: RwLock::new(HashMap::new()),
        })
    }

    /// Build a store from already-parsed schemas, without a backend
    ///
    /// Lets tests share one store instead of reloading from the network.
    pub fn with_schemas(schemas: HashMap<String, serde_json::Value>) -> Self {
        Self {
            backend: None,
            schemas: RwLock::new(
                schemas
                    .into_iter()
                    .map(|(k, v)| (k, Arc::new(v)))
                    .collect(),
            ),
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Persist a schema for a domain-trimmed event type
    ///
    /// Rejects documents that are not JSON Schemas before writing through.
    pub async fn save(&self, event_type: &str, schema: serde_json::Value) -> Result<()> {
        let compiled = ensure_json_schema(event_type, &schema)?;

        if let Some(backend) = &self.backend {
            backend.put(event_type, &serde_json::to_string(&schema)?).await?;
        }

        {
            let mut schemas = self.schemas.write().map_err(|e| {
                TransitError::Provider(format!("Schema store lock poisoned: {}", e))
            })?;
            schemas.insert(event_type.to_string(), Arc::new(schema));
        }
        self.validators
            .write()
            .map_err(|e| TransitError::Provider(format!("Validator cache lock poisoned: {}", e)))?
            .insert(event_type.to_string(), Arc::new(compiled));

        tracing::debug!(event_type = %event_type, "Schema saved");
        Ok(())
    }

    /// Look up the schema for a domain-trimmed event type
    pub fn get(&self, event_type: &str) -> Result<Arc<serde_json::Value>> {
        let schemas = self.schemas.read().map_err(|e| {
            TransitError::Provider(format!("Schema store lock poisoned: {}", e))
        })?;

        schemas.get(event_type).cloned().ok_or_else(|| {
            TransitError::Schema(format!(
                "Schema for {} does not exist. Make sure it's been added to your `events` \
                 codebase and has been loaded into the schema store",
                event_type
            ))
        })
    }

    /// Compiled validator for a domain-trimmed event type
    pub fn validator(&self, event_type: &str) -> Result<Arc<JSONSchema>> {
        let cached = self
            .validators
            .read()
            .map_err(|e| TransitError::Provider(format!("Validator cache lock poisoned: {}", e)))?
            .get(event_type)
            .cloned();
        if let Some(validator) = cached {
            return Ok(validator);
        }

        let schema = self.get(event_type)?;
        let compiled = Arc::new(JSONSchema::compile(&schema).map_err(|e| {
            TransitError::Schema(format!(
                "Schema for {} could not be compiled: {}",
                event_type, e
            ))
        })?);

        let mut validators = self
            .validators
            .write()
            .map_err(|e| TransitError::Provider(format!("Validator cache lock poisoned: {}", e)))?;
        Ok(validators
            .entry(event_type.to_string())
            .or_insert(compiled)
            .clone())
    }

    /// All cached event types, sorted
    pub fn list_types(&self) -> Result<Vec<String>> {
        let schemas = self.schemas.read().map_err(|e| {
            TransitError::Provider(format!("Schema store lock poisoned: {}", e))
        })?;
        let mut types: Vec<String> = schemas.keys().cloned().collect();
        types.sort();
        Ok(types)
    }
}

fn ensure_json_schema(event_type: &str, schema: &serde_json::Value) -> Result<JSONSchema> {
    if !schema.is_object() {
        return Err(TransitError::Validation(format!(
            "Schema for '{}' must be a JSON object",
            event_type
        )));
    }

    JSONSchema::compile(schema).map_err(|e| {
        TransitError::Validation(format!(
            "Schema for '{}' is not a valid JSON Schema: {}",
            event_type, e
        ))
    })
}
