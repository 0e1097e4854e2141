//! healthtrail - endpoint health monitoring.
//!
//! Probes configured endpoints, keeps a bounded history of results and
//! health transitions per endpoint, aggregates hourly uptime, and drives
//! alert notifications from consecutive failures and successes.

pub mod alerting;
pub mod config;
pub mod endpoint;
pub mod maintenance;
pub mod probe;
pub mod scheduler;
pub mod storage;
