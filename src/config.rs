//! Transit configuration
//!
//! An explicit value handed to `Transit::start`; there is no process-wide
//! configuration singleton.

use crate::error::{Result, TransitError};
use crate::naming::Naming;
use crate::transporter::TransporterConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for one Transit instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitConfig {
    /// Organization-wide namespace prefix, e.g. `com.acme`
    #[serde(default)]
    pub domain: String,

    /// Default source segment for this service, e.g. `user.backend`
    #[serde(default)]
    pub source_root: String,

    #[serde(default)]
    pub transporter: TransporterConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Inject a W3C `traceparent` header on publish
    #[serde(default)]
    pub trace_headers: bool,

    /// Upper bound on each subscribe call during startup
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,
}

fn default_subscribe_timeout() -> u64 {
    30
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            source_root: String::new(),
            transporter: TransporterConfig::default(),
            pool: PoolConfig::default(),
            trace_headers: false,
            subscribe_timeout_secs: default_subscribe_timeout(),
        }
    }
}

impl TransitConfig {
    pub fn new(domain: impl Into<String>, source_root: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            source_root: source_root.into(),
            ..Default::default()
        }
    }

    pub fn with_transporter(mut self, transporter: TransporterConfig) -> Self {
        self.transporter = transporter;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_trace_headers(mut self, enabled: bool) -> Self {
        self.trace_headers = enabled;
        self
    }

    /// Validate naming and pool settings
    pub fn validate(&self) -> Result<()> {
        self.naming()?;
        self.pool.validate()
    }

    /// Naming context for this configuration
    pub fn naming(&self) -> Result<Naming> {
        Naming::new(self.domain.clone(), self.source_root.clone())
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

/// Handler worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Concurrent handler invocations
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Dispatches that may wait for a worker before `submit` blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_workers() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    20
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TransitError::Configuration(
                "pool.workers must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TransitError::Configuration(
                "pool.queueCapacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
