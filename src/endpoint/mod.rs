//! Endpoint configuration and the monitoring data model.
//!
//! An [`Endpoint`] is configured externally and treated as read-only once the
//! scheduler has started. Everything the monitor learns about it over time
//! lives in a [`Status`], owned by the storage layer.

mod result;
mod status;

pub use result::*;
pub use status::*;

use crate::maintenance::MaintenanceWindow;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A monitored target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub url: String,
    /// Seconds between two probes (default: 60)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds before a probe gives up (default: 10)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// HTTP status a healthy response must carry (default: 200)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_expected_status() -> u16 {
    200
}

impl Endpoint {
    pub fn new(group: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            url: String::new(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            expected_status: default_expected_status(),
            alerts: Vec::new(),
            maintenance_windows: Vec::new(),
        }
    }

    /// Unique key derived from the group and the name.
    pub fn key(&self) -> String {
        endpoint_key(&self.group, &self.name)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn enabled_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.enabled)
    }
}

/// Build the storage key for an endpoint, e.g. `("Core", "API v2")` -> `core_api-v2`.
pub fn endpoint_key(group: &str, name: &str) -> String {
    format!("{}_{}", sanitize(group), sanitize(name))
}

fn sanitize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            '/' | '_' | ',' | '.' | '#' | '+' | '&' | ' ' => '-',
            other => other,
        })
        .collect()
}

/// Alert configuration attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Provider that delivers the notification (e.g. "webhook", "log")
    #[serde(rename = "type")]
    pub alert_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Failed results in a row needed before the alert triggers
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful results in a row needed before a triggered alert resolves
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default)]
    pub send_on_resolved: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

impl Alert {
    pub fn new(alert_type: &str) -> Self {
        Self {
            alert_type: alert_type.to_string(),
            enabled: true,
            description: None,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            send_on_resolved: false,
        }
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    /// Hex SHA-256 over every field that changes how the alert behaves.
    ///
    /// Persisted triggered alerts are keyed by this value, so editing an alert
    /// in the configuration orphans its old record.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.alert_type.as_bytes());
        hasher.update(b"_");
        hasher.update(self.description().as_bytes());
        hasher.update(format!(
            "_{}_{}_{}_{}_",
            self.enabled, self.send_on_resolved, self.success_threshold, self.failure_threshold
        ));
        hex::encode(hasher.finalize())
    }
}
