//! NatsRoute Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Routes can be declared in the file as `[[routes]]` tables; turning them
//! into validated routes is the router's job, this crate only carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub broker: BrokerSettings,
    pub metrics: MetricsSettings,
    pub routes: Vec<RouteDefinition>,
}

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Client name; a random `natsroute-xxxxxxxx` name is generated when unset
    pub name: Option<String>,
    pub connect_timeout_secs: u64,
    pub reconnect_wait_secs: u64,
    /// None means reconnect forever
    pub max_reconnects: Option<usize>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: None,
            connect_timeout_secs: 5,
            reconnect_wait_secs: 2,
            max_reconnects: None,
        }
    }
}

/// Broker worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Workers started per route
    pub workers: usize,
    /// How long shutdown waits for subscriptions to drain
    pub drain_timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            drain_timeout_secs: 10,
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A route as declared in the config file.
///
/// Field names mirror the route builder options. Validation happens when the
/// definition is converted into a route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteDefinition {
    /// broadcast, queue, request_reply or durable_stream
    pub pattern: String,
    pub subject: String,
    pub queue_group: Option<String>,
    pub stream: Option<String>,
    pub durable: Option<String>,
    pub ack_wait_secs: Option<u64>,
    pub max_deliver: Option<i64>,
    /// all, last, new, by_start_sequence, by_start_time or last_per_subject
    pub deliver_policy: Option<String>,
    pub start_sequence: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub dedup_window_secs: Option<u64>,
    pub dead_letter: bool,
    pub handler_timeout_ms: Option<u64>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nats.url.trim().is_empty() {
            return Err(ConfigError::ValidationError("nats.url must not be empty".to_string()));
        }
        if self.broker.workers == 0 {
            return Err(ConfigError::ValidationError(
                "broker.workers must be at least 1".to_string(),
            ));
        }
        if self.metrics.enabled && self.metrics.listen.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "metrics.listen must be set when metrics are enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# NatsRoute Configuration
# Environment variables (NATSROUTE_*) override these settings

[nats]
url = "nats://localhost:4222"
# name = "orders-service"
connect_timeout_secs = 5
reconnect_wait_secs = 2
# max_reconnects = 60

[broker]
workers = 5
drain_timeout_secs = 10

[metrics]
enabled = false
listen = "0.0.0.0:9090"

[[routes]]
pattern = "queue"
subject = "orders.created"
queue_group = "order-workers"

[[routes]]
pattern = "request_reply"
subject = "orders.lookup"
queue_group = "order-lookup"
handler_timeout_ms = 2000

[[routes]]
pattern = "durable_stream"
subject = "payments.settled"
stream = "PAYMENTS"
durable = "settlement-processor"
ack_wait_secs = 30
max_deliver = 5
deliver_policy = "all"
dead_letter = true
"#
        .to_string()
    }
}
