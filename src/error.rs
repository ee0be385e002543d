//! Error types for a3s-transit

use thiserror::Error;

/// Errors that can occur while publishing, receiving or validating events
#[derive(Debug, Error)]
pub enum TransitError {
    /// Invalid or missing `domain` / `source_root`, bad pool sizes, etc.
    ///
    /// Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed envelope, schema violation, bad naming input, or a pull
    /// consumer that does not exist
    #[error("Validation error: {0}")]
    Validation(String),

    /// A schema, or the schema store itself, is missing on the backend
    #[error("Schema error: {0}")]
    Schema(String),

    /// A service was registered without a name
    #[error("Service name '{0}' is invalid")]
    ServiceName(String),

    /// Backend deadline exceeded (connect, publish ack, subscribe)
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The backend requires a pre-provisioned topic/subscription that is absent
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Transporter connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend error that fits no other category
    #[error("Provider error: {0}")]
    Provider(String),
}

impl TransitError {
    /// Whether a caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransitError::Timeout(_) | TransitError::Connection(_))
    }
}

/// Result type alias for transit operations
pub type Result<T> = std::result::Result<T, TransitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransitError::Timeout("publish".into()).is_retryable());
        assert!(TransitError::Connection("refused".into()).is_retryable());
        assert!(!TransitError::TopicNotFound("calc.add.v1".into()).is_retryable());
        assert!(!TransitError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_service_name_message() {
        let err = TransitError::ServiceName(String::new());
        assert_eq!(err.to_string(), "Service name '' is invalid");
    }
}
