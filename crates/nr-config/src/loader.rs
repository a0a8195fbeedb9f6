//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "natsroute.toml",
    "./config/config.toml",
    "/etc/natsroute/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a caller-supplied variable lookup
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup);

        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Some(path) = lookup("NATSROUTE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_overrides<F>(config: &mut AppConfig, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    // NATS
    if let Some(val) = lookup("NATSROUTE_NATS_URL") {
        config.nats.url = val;
    }
    if let Some(val) = lookup("NATSROUTE_NATS_NAME") {
        config.nats.name = Some(val);
    }
    if let Some(val) = lookup("NATSROUTE_NATS_CONNECT_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse() {
            config.nats.connect_timeout_secs = secs;
        }
    }
    if let Some(val) = lookup("NATSROUTE_NATS_RECONNECT_WAIT_SECS") {
        if let Ok(secs) = val.parse() {
            config.nats.reconnect_wait_secs = secs;
        }
    }
    if let Some(val) = lookup("NATSROUTE_NATS_MAX_RECONNECTS") {
        if let Ok(max) = val.parse() {
            config.nats.max_reconnects = Some(max);
        }
    }

    // Broker
    if let Some(val) = lookup("NATSROUTE_WORKERS") {
        if let Ok(workers) = val.parse() {
            config.broker.workers = workers;
        }
    }
    if let Some(val) = lookup("NATSROUTE_DRAIN_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse() {
            config.broker.drain_timeout_secs = secs;
        }
    }

    // Metrics
    if let Some(val) = lookup("NATSROUTE_METRICS_ENABLED") {
        config.metrics.enabled = val.parse().unwrap_or(false);
    }
    if let Some(val) = lookup("NATSROUTE_METRICS_LISTEN") {
        config.metrics.listen = val;
    }
}
