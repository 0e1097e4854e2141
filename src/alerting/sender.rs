//! Notification delivery.

use crate::endpoint::{Alert, CheckResult, Endpoint};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Notification error types.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no provider configured for alert type {0:?}")]
    UnknownProvider(String),
    #[error("provider rejected the notification with status {0}")]
    Rejected(u16),
}

/// Delivers alert notifications.
#[async_trait]
pub trait AlertSender: Send + Sync {
    /// Send a trigger notification, or a resolve one when `resolved` is set.
    ///
    /// A trigger may return a key identifying the incident at the provider;
    /// it is handed back as `resolve_key` when the alert resolves.
    async fn send(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        result: &CheckResult,
        resolved: bool,
        resolve_key: Option<&str>,
    ) -> Result<Option<String>, SendError>;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    endpoint_name: &'a str,
    endpoint_group: &'a str,
    endpoint_key: String,
    description: &'a str,
    success: bool,
    timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: &'a Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup_key: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    dedup_key: Option<String>,
}

/// POSTs a JSON notification to a fixed URL.
///
/// A `dedup_key` in the response body of a trigger becomes the resolve key.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSender for WebhookSender {
    async fn send(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        result: &CheckResult,
        resolved: bool,
        resolve_key: Option<&str>,
    ) -> Result<Option<String>, SendError> {
        let payload = WebhookPayload {
            event: if resolved { "resolve" } else { "trigger" },
            endpoint_name: &endpoint.name,
            endpoint_group: &endpoint.group,
            endpoint_key: endpoint.key(),
            description: alert.description(),
            success: result.success,
            timestamp: result.timestamp.to_rfc3339(),
            errors: &result.errors,
            dedup_key: resolve_key,
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Rejected(status.as_u16()));
        }
        if resolved {
            return Ok(None);
        }
        // Most webhooks answer with an empty or non-JSON body
        let body = response.bytes().await?;
        let parsed: WebhookResponse = serde_json::from_slice(&body).unwrap_or_default();
        Ok(parsed.dedup_key.filter(|key| !key.is_empty()))
    }
}

/// Writes notifications to the log instead of delivering them.
pub struct LogSender;

#[async_trait]
impl AlertSender for LogSender {
    async fn send(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        result: &CheckResult,
        resolved: bool,
        _resolve_key: Option<&str>,
    ) -> Result<Option<String>, SendError> {
        let state = if resolved { "RESOLVED" } else { "TRIGGERED" };
        tracing::warn!(
            "{}: {} - {} ({} error(s))",
            state,
            endpoint.key(),
            alert.description(),
            result.errors.len()
        );
        Ok(None)
    }
}

/// Routes each notification to the sender registered for its alert type.
#[derive(Default)]
pub struct Dispatcher {
    senders: HashMap<String, Arc<dyn AlertSender>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, alert_type: &str, sender: Arc<dyn AlertSender>) -> Self {
        self.senders.insert(alert_type.to_string(), sender);
        self
    }

    pub fn supports(&self, alert_type: &str) -> bool {
        self.senders.contains_key(alert_type)
    }
}

#[async_trait]
impl AlertSender for Dispatcher {
    async fn send(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        result: &CheckResult,
        resolved: bool,
        resolve_key: Option<&str>,
    ) -> Result<Option<String>, SendError> {
        let sender = self
            .senders
            .get(&alert.alert_type)
            .ok_or_else(|| SendError::UnknownProvider(alert.alert_type.clone()))?;
        sender.send(endpoint, alert, result, resolved, resolve_key).await
    }
}
