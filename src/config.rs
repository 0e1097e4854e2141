//! Configuration module for healthtrail.
//!
//! Server settings come from environment variables with sensible defaults;
//! the monitored endpoints come from a JSON file.

use crate::endpoint::Endpoint;
use crate::maintenance::{MaintenanceError, MaintenanceWindow};
use crate::storage::StorageType;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<MaintenanceError> for ConfigError {
    fn from(e: MaintenanceError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Storage backend (default: memory)
    pub storage_type: StorageType,
    /// Path to the SQLite database file (default: "healthtrail.db")
    pub db_path: String,
    /// Path to the endpoints file (default: "healthtrail.json")
    pub config_path: String,
    /// TTL of the read-through status cache; zero disables it (default: 10s)
    pub cache_ttl: Duration,
    /// Skip a tick while the endpoint's previous probe runs (default: true)
    pub monitoring_lock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            db_path: "healthtrail.db".to_string(),
            config_path: "healthtrail.json".to_string(),
            cache_ttl: Duration::from_secs(10),
            monitoring_lock: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEALTHTRAIL_STORAGE_TYPE`: "memory" or "sqlite" (default: "memory")
    /// - `HEALTHTRAIL_DB_PATH`: Database file path (default: "healthtrail.db")
    /// - `HEALTHTRAIL_CONFIG_PATH`: Endpoints file path (default: "healthtrail.json")
    /// - `HEALTHTRAIL_CACHE_TTL_SECS`: Status cache TTL in seconds (default: 10)
    /// - `HEALTHTRAIL_MONITORING_LOCK`: "false" to let probes overlap (default: true)
    pub fn load() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(storage_type) = lookup("HEALTHTRAIL_STORAGE_TYPE") {
            match storage_type.parse() {
                Ok(storage_type) => cfg.storage_type = storage_type,
                Err(e) => tracing::warn!("Ignoring HEALTHTRAIL_STORAGE_TYPE: {}", e),
            }
        }

        if let Some(db_path) = lookup("HEALTHTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(config_path) = lookup("HEALTHTRAIL_CONFIG_PATH") {
            cfg.config_path = config_path;
        }

        if let Some(ttl_str) = lookup("HEALTHTRAIL_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl_str.parse() {
                cfg.cache_ttl = Duration::from_secs(secs);
            }
        }

        if let Some(lock_str) = lookup("HEALTHTRAIL_MONITORING_LOCK") {
            if let Ok(lock) = lock_str.parse() {
                cfg.monitoring_lock = lock;
            }
        }

        cfg
    }
}

/// Webhook notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Request timeout in seconds (default: 10)
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// Contents of the endpoints file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Windows applying to every endpoint
    #[serde(default)]
    pub maintenance: Vec<MaintenanceWindow>,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

impl MonitorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let cfg: MonitorConfig = serde_json::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut keys = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ConfigError::Invalid("endpoint name must not be empty".to_string()));
            }
            if [&endpoint.name, &endpoint.group]
                .iter()
                .any(|s| s.contains('"') || s.contains('\\'))
            {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} has a name or group containing '\"' or '\\'",
                    endpoint.name
                )));
            }
            if !keys.insert(endpoint.key()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate endpoint key {:?}",
                    endpoint.key()
                )));
            }
            for alert in &endpoint.alerts {
                if alert.failure_threshold == 0 || alert.success_threshold == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "alert thresholds of endpoint {:?} must be at least 1",
                        endpoint.name
                    )));
                }
            }
            for window in &endpoint.maintenance_windows {
                window.validate()?;
            }
        }
        for window in &self.maintenance {
            window.validate()?;
        }
        Ok(())
    }
}
