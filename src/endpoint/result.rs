//! Probe results and health-state transition events.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// When the probe was sent
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Whether a connection to the host was established
    pub connected: bool,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_rcode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_results: Vec<ConditionResult>,
}

impl CheckResult {
    pub fn new(timestamp: DateTime<Utc>, success: bool, duration: Duration) -> Self {
        Self {
            timestamp,
            success,
            connected: success,
            duration,
            http_status: None,
            hostname: None,
            ip: None,
            dns_rcode: None,
            errors: Vec::new(),
            condition_results: Vec::new(),
        }
    }

    /// Record an error, ignoring duplicates.
    pub fn add_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }
}

/// Outcome of one condition of an endpoint, e.g. `[STATUS] == 200`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub condition: String,
    pub success: bool,
}

/// Kind of health-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Monitoring of the endpoint began
    Start,
    Healthy,
    Unhealthy,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Healthy => "HEALTHY",
            EventType::Unhealthy => "UNHEALTHY",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "START" => Ok(EventType::Start),
            "HEALTHY" => Ok(EventType::Healthy),
            "UNHEALTHY" => Ok(EventType::Unhealthy),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// A health-state transition at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Healthy or unhealthy event matching the result's outcome.
    pub fn from_result(result: &CheckResult) -> Self {
        Self {
            event_type: if result.success {
                EventType::Healthy
            } else {
                EventType::Unhealthy
            },
            timestamp: result.timestamp,
        }
    }

    /// Start event for the very first result of an endpoint, dated when that
    /// probe was sent.
    pub fn start_for(result: &CheckResult) -> Self {
        let elapsed = TimeDelta::from_std(result.duration).unwrap_or(TimeDelta::zero());
        Self {
            event_type: EventType::Start,
            timestamp: result.timestamp - elapsed,
        }
    }
}
