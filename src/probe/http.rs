//! HTTP probe implementation.

use super::{Probe, ProbeError};
use crate::endpoint::{CheckResult, ConditionResult, Endpoint};

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};

/// GETs the endpoint URL and checks the response status.
#[derive(Debug, Default, Clone)]
pub struct HttpProbe;

impl HttpProbe {
    pub fn new() -> Self {
        Self
    }
}

/// Prefix bare addresses with `http://`.
pub fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Fetch `url` and return the response status once the full body arrived.
async fn fetch_status(url: &str, timeout: Duration) -> Result<u16, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else if e.is_builder() {
            ProbeError::Config(e.to_string())
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;
    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok(status)
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> CheckResult {
        let url = normalize_url(&endpoint.url);
        let timestamp = Utc::now();
        let start = Instant::now();
        let outcome = fetch_status(&url, endpoint.timeout()).await;

        let mut result = CheckResult::new(timestamp, false, start.elapsed());
        result.hostname = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let condition = format!("[STATUS] == {}", endpoint.expected_status);
        match outcome {
            Ok(status) => {
                let success = status == endpoint.expected_status;
                result.connected = true;
                result.success = success;
                result.http_status = Some(status);
                result.condition_results.push(ConditionResult { condition, success });
            }
            Err(e) => {
                result.connected = false;
                result.add_error(e.to_string());
                result.condition_results.push(ConditionResult {
                    condition,
                    success: false,
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.org/health"), "http://example.org/health");
        assert_eq!(normalize_url("https://example.org"), "https://example.org");
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let result = fetch_status("http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_failed_result() {
        let mut ep = Endpoint::new("", "broken");
        ep.url = "http://256.256.256.256".to_string();
        ep.timeout_secs = 1;
        let result = HttpProbe::new().probe(&ep).await;

        assert!(!result.success);
        assert!(!result.connected);
        assert_eq!(result.http_status, None);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.condition_results,
            vec![ConditionResult {
                condition: "[STATUS] == 200".to_string(),
                success: false
            }]
        );
    }
}
