//! Storage for endpoint statuses.
//!
//! Two interchangeable backends implement [`Store`]: a volatile in-memory
//! store and a durable SQLite store. Both share the caps, the cleanup
//! thresholds and the paging logic defined here.

mod cache;
mod memory;
pub mod paging;
mod sql;

pub use cache::*;
pub use memory::*;
pub use paging::PagingParams;
pub use sql::*;

use crate::endpoint::{Alert, CheckResult, Endpoint, Status};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Results kept per endpoint.
pub const MAXIMUM_NUMBER_OF_RESULTS: usize = 100;
/// Events kept per endpoint.
pub const MAXIMUM_NUMBER_OF_EVENTS: usize = 50;

/// Hourly uptime buckets older than this may be deleted.
pub const UPTIME_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Bucket count (10 days of hours) above which old buckets are purged.
pub const UPTIME_CLEANUP_THRESHOLD: usize = 10 * 24;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("endpoint not found")]
    EndpointNotFound,
    #[error("'from' cannot be after 'to'")]
    InvalidTimeRange,
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("malformed stored data: {0}")]
    Decode(String),
}

impl StoreError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::EndpointNotFound => 404,
            StoreError::InvalidTimeRange => 400,
            _ => 500,
        }
    }
}

/// Persisted marker of an alert that is currently firing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggeredAlert {
    /// Provider-issued key needed to resolve the incident, if any
    pub resolve_key: String,
    pub successes_in_a_row: u32,
}

/// Operations every storage backend provides.
pub trait Store: Send + Sync {
    /// All statuses sorted by key, each with its history windowed by `params`.
    fn get_all(&self, params: &PagingParams) -> Result<Vec<Status>, StoreError>;

    /// A copy of the status for `key`, with its history windowed by `params`.
    fn get_by_key(&self, key: &str, params: &PagingParams) -> Result<Status, StoreError>;

    /// Ratio of successful executions between `from` and `to`; 0 without data.
    fn uptime(&self, key: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError>;

    /// Average response time in milliseconds between `from` and `to`; 0 without data.
    fn average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Average response time in milliseconds of every hour that had executions.
    fn hourly_average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>, StoreError>;

    /// Record a result, creating the status on first use.
    fn insert(&self, endpoint: &Endpoint, result: &CheckResult) -> Result<(), StoreError>;

    /// Remove every status whose key is not in `keys`; returns how many were removed.
    fn delete_not_in_keys(&self, keys: &[String]) -> usize;

    fn get_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
    ) -> Result<Option<TriggeredAlert>, StoreError>;

    fn upsert_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        triggered: &TriggeredAlert,
    ) -> Result<(), StoreError>;

    fn delete_triggered_alert(&self, endpoint: &Endpoint, alert: &Alert) -> Result<(), StoreError>;

    /// Remove the endpoint's triggered alerts whose checksum is not in `checksums`.
    fn delete_triggered_alerts_not_in_checksums(
        &self,
        endpoint: &Endpoint,
        checksums: &[String],
    ) -> usize;

    /// Wipe everything.
    fn clear(&self);

    /// Release the backend before shutdown.
    fn close(&self) {}
}

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    Sqlite,
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(StorageType::Memory),
            "sqlite" => Ok(StorageType::Sqlite),
            other => Err(format!("unknown storage type: {}", other)),
        }
    }
}

/// Open the configured backend, behind a read-through cache when `cache_ttl`
/// is non-zero.
pub fn open_store<P: AsRef<Path>>(
    storage_type: StorageType,
    path: P,
    cache_ttl: Duration,
) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match (storage_type, cache_ttl.is_zero()) {
        (StorageType::Memory, true) => Arc::new(MemoryStore::new()),
        (StorageType::Memory, false) => Arc::new(CachedStore::new(MemoryStore::new(), cache_ttl)),
        (StorageType::Sqlite, true) => Arc::new(SqlStore::new(path)?),
        (StorageType::Sqlite, false) => Arc::new(CachedStore::new(SqlStore::new(path)?, cache_ttl)),
    };
    Ok(store)
}

/// Unix timestamp of the start of the hour containing `dt`.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> i64 {
    let ts = dt.timestamp();
    ts - ts.rem_euclid(3600)
}

/// Buckets whose hour is before this timestamp are eligible for deletion.
pub(crate) fn uptime_cleanup_cutoff(now: DateTime<Utc>) -> i64 {
    now.timestamp() - UPTIME_RETENTION.as_secs() as i64 - 3600
}

pub(crate) fn check_time_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), StoreError> {
    if from > to {
        return Err(StoreError::InvalidTimeRange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_hour() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            truncate_to_hour(dt),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap().timestamp()
        );
        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(truncate_to_hour(before_epoch), -3600);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StoreError::EndpointNotFound.status_code(), 404);
        assert_eq!(StoreError::InvalidTimeRange.status_code(), 400);
        assert_eq!(StoreError::Decode("bad".to_string()).status_code(), 500);
    }

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("memory".parse::<StorageType>(), Ok(StorageType::Memory));
        assert_eq!("SQLite".parse::<StorageType>(), Ok(StorageType::Sqlite));
        assert!("postgres".parse::<StorageType>().is_err());
    }

    #[test]
    fn test_open_store_memory() {
        let store = open_store(StorageType::Memory, "", Duration::from_secs(5)).unwrap();
        assert!(store.get_all(&PagingParams::new()).unwrap().is_empty());
    }
}
