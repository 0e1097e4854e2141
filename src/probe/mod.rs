//! Probes that turn an endpoint into a check result.

mod http;

pub use http::*;

use crate::endpoint::{CheckResult, Endpoint};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Checks an endpoint once.
///
/// Failures are part of the result (`success == false` with errors), never
/// an `Err`, so every probe yields something to store.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> CheckResult;
}
