//! JetStream transporter configuration

use crate::schema::DEFAULT_STORE_NAME;
use serde::{Deserialize, Serialize};

/// NATS JetStream connection settings
///
/// Streams, durable consumers and the schema bucket are provisioned out of
/// band; nothing here creates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamConfig {
    /// NATS server URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Authentication token
    #[serde(default)]
    pub token: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Request (publish ack, consumer lookup) timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Key-value bucket holding event schemas
    #[serde(default = "default_schema_bucket")]
    pub schema_bucket: String,
}

fn default_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_schema_bucket() -> String {
    DEFAULT_STORE_NAME.to_string()
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            schema_bucket: default_schema_bucket(),
        }
    }
}
