//! Short-lived read-through cache in front of a store.
//!
//! Only [`Store::get_all`] is cached, keyed by its paging parameters. Entries
//! expire after the TTL and writes never invalidate them, so a reader may see
//! data up to one TTL old.

use super::{PagingParams, Store, StoreError, TriggeredAlert};
use crate::endpoint::{Alert, CheckResult, Endpoint, Status};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct CacheEntry {
    statuses: Vec<Status>,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Wraps a store and caches the result of `get_all`.
pub struct CachedStore<S> {
    inner: S,
    ttl: Duration,
    entries: Mutex<HashMap<PagingParams, CacheEntry>>,
}

impl<S: Store> CachedStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PagingParams, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, params: &PagingParams) -> Option<Vec<Status>> {
        let mut entries = self.entries();
        match entries.get(params) {
            Some(entry) if !entry.is_expired(self.ttl) => return Some(entry.statuses.clone()),
            Some(_) => {}
            None => return None,
        }
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(ttl));
        tracing::trace!("CachedStore: Evicted {} expired entries", before - entries.len());
        None
    }
}

impl<S: Store> Store for CachedStore<S> {
    fn get_all(&self, params: &PagingParams) -> Result<Vec<Status>, StoreError> {
        if let Some(statuses) = self.cached(params) {
            return Ok(statuses);
        }
        // Computed without holding the lock; concurrent misses may both query
        let statuses = self.inner.get_all(params)?;
        self.entries().insert(
            *params,
            CacheEntry {
                statuses: statuses.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(statuses)
    }

    fn get_by_key(&self, key: &str, params: &PagingParams) -> Result<Status, StoreError> {
        self.inner.get_by_key(key, params)
    }

    fn uptime(&self, key: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError> {
        self.inner.uptime(key, from, to)
    }

    fn average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner.average_response_time(key, from, to)
    }

    fn hourly_average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>, StoreError> {
        self.inner.hourly_average_response_time(key, from, to)
    }

    fn insert(&self, endpoint: &Endpoint, result: &CheckResult) -> Result<(), StoreError> {
        self.inner.insert(endpoint, result)
    }

    fn delete_not_in_keys(&self, keys: &[String]) -> usize {
        self.inner.delete_not_in_keys(keys)
    }

    fn get_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
    ) -> Result<Option<TriggeredAlert>, StoreError> {
        self.inner.get_triggered_alert(endpoint, alert)
    }

    fn upsert_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        triggered: &TriggeredAlert,
    ) -> Result<(), StoreError> {
        self.inner.upsert_triggered_alert(endpoint, alert, triggered)
    }

    fn delete_triggered_alert(&self, endpoint: &Endpoint, alert: &Alert) -> Result<(), StoreError> {
        self.inner.delete_triggered_alert(endpoint, alert)
    }

    fn delete_triggered_alerts_not_in_checksums(
        &self,
        endpoint: &Endpoint,
        checksums: &[String],
    ) -> usize {
        self.inner.delete_triggered_alerts_not_in_checksums(endpoint, checksums)
    }

    fn clear(&self) {
        self.inner.clear();
        self.entries().clear();
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn all() -> PagingParams {
        PagingParams::new().with_results(1, 100).with_events(1, 50)
    }

    fn insert(store: &impl Store, name: &str) {
        let result = CheckResult::new(Utc::now(), true, Duration::from_millis(5));
        store.insert(&Endpoint::new("", name), &result).unwrap();
    }

    #[test]
    fn test_get_all_is_stale_until_expiry() {
        let store = CachedStore::new(MemoryStore::new(), Duration::from_millis(100));
        insert(&store, "a");
        assert_eq!(store.get_all(&all()).unwrap().len(), 1);

        insert(&store, "b");
        assert_eq!(store.get_all(&all()).unwrap().len(), 1);
        // Other parameters are a separate entry
        assert_eq!(store.get_all(&PagingParams::new()).unwrap().len(), 2);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(store.get_all(&all()).unwrap().len(), 2);
    }

    #[test]
    fn test_point_reads_are_not_cached() {
        let store = CachedStore::new(MemoryStore::new(), Duration::from_secs(60));
        insert(&store, "a");
        let before = store.get_by_key("_a", &all()).unwrap();
        insert(&store, "a");
        let after = store.get_by_key("_a", &all()).unwrap();
        assert_eq!(before.results.len(), 1);
        assert_eq!(after.results.len(), 2);
    }

    #[test]
    fn test_clear_wipes_the_cache() {
        let store = CachedStore::new(MemoryStore::new(), Duration::from_secs(60));
        insert(&store, "a");
        assert_eq!(store.get_all(&all()).unwrap().len(), 1);
        store.clear();
        assert!(store.get_all(&all()).unwrap().is_empty());
        assert!(store.inner().get_all(&all()).unwrap().is_empty());
    }
}
