//! Volatile in-memory store.

mod uptime;

pub use uptime::*;

use super::paging::page_of;
use super::{
    check_time_range, PagingParams, Store, StoreError, TriggeredAlert, MAXIMUM_NUMBER_OF_EVENTS,
    MAXIMUM_NUMBER_OF_RESULTS,
};
use crate::endpoint::{cap_events, cap_results, Alert, CheckResult, Endpoint, Event, Status};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Statuses kept in a map behind a single read/write lock.
///
/// Triggered alerts are not persisted: the store does not survive a restart,
/// so there is nothing to deduplicate across one.
#[derive(Default)]
pub struct MemoryStore {
    statuses: RwLock<BTreeMap<String, Status>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Status>> {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Status>> {
        self.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_status<T>(&self, key: &str, f: impl FnOnce(&Status) -> T) -> Result<T, StoreError> {
        self.read().get(key).map(f).ok_or(StoreError::EndpointNotFound)
    }
}

/// Append `result` to `status`, recording a transition event when the
/// outcome flips, then enforce the caps and feed the uptime buckets.
pub fn add_result(status: &mut Status, result: &CheckResult, now: DateTime<Utc>) {
    if status.events.is_empty() {
        status.events.push(Event::start_for(result));
        status.events.push(Event::from_result(result));
    } else if status
        .results
        .last()
        .is_some_and(|last| last.success != result.success)
    {
        status.events.push(Event::from_result(result));
    }
    status.results.push(result.clone());
    cap_results(&mut status.results, MAXIMUM_NUMBER_OF_RESULTS);
    cap_events(&mut status.events, MAXIMUM_NUMBER_OF_EVENTS);
    status.record_streak(result.success);
    record_uptime(&mut status.uptime, result, now);
}

/// Copy of `status` whose history is limited to the requested pages.
pub fn paged_copy(status: &Status, params: &PagingParams) -> Status {
    let mut copy = status.skeleton();
    copy.results = page_of(&status.results, params.results_window(status.results.len()));
    copy.events = page_of(&status.events, params.events_window(status.events.len()));
    copy
}

impl Store for MemoryStore {
    fn get_all(&self, params: &PagingParams) -> Result<Vec<Status>, StoreError> {
        Ok(self.read().values().map(|s| paged_copy(s, params)).collect())
    }

    fn get_by_key(&self, key: &str, params: &PagingParams) -> Result<Status, StoreError> {
        self.with_status(key, |s| paged_copy(s, params))
    }

    fn uptime(&self, key: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError> {
        check_time_range(from, to)?;
        self.with_status(key, |s| uptime_between(&s.uptime, from, to))
    }

    fn average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        check_time_range(from, to)?;
        self.with_status(key, |s| average_response_time_between(&s.uptime, from, to))
    }

    fn hourly_average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>, StoreError> {
        check_time_range(from, to)?;
        self.with_status(key, |s| hourly_average_response_time_between(&s.uptime, from, to))
    }

    fn insert(&self, endpoint: &Endpoint, result: &CheckResult) -> Result<(), StoreError> {
        let mut statuses = self.write();
        let status = statuses
            .entry(endpoint.key())
            .or_insert_with(|| Status::new(endpoint));
        add_result(status, result, Utc::now());
        Ok(())
    }

    fn delete_not_in_keys(&self, keys: &[String]) -> usize {
        let keep: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut statuses = self.write();
        let before = statuses.len();
        statuses.retain(|key, _| keep.contains(key.as_str()));
        before - statuses.len()
    }

    fn get_triggered_alert(
        &self,
        _endpoint: &Endpoint,
        _alert: &Alert,
    ) -> Result<Option<TriggeredAlert>, StoreError> {
        Ok(None)
    }

    fn upsert_triggered_alert(
        &self,
        _endpoint: &Endpoint,
        _alert: &Alert,
        _triggered: &TriggeredAlert,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_triggered_alert(&self, _endpoint: &Endpoint, _alert: &Alert) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_triggered_alerts_not_in_checksums(
        &self,
        _endpoint: &Endpoint,
        _checksums: &[String],
    ) -> usize {
        0
    }

    fn clear(&self) {
        self.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EventType;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use std::time::Duration;

    fn result_at(ts: DateTime<Utc>, success: bool) -> CheckResult {
        CheckResult::new(ts, success, Duration::from_millis(100))
    }

    fn all() -> PagingParams {
        PagingParams::new().with_results(1, 1000).with_events(1, 1000)
    }

    #[test]
    fn test_first_insert_creates_start_and_transition_events() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("core", "api");
        let now = Utc::now();
        store.insert(&ep, &result_at(now, false)).unwrap();

        let status = store.get_by_key(&ep.key(), &all()).unwrap();
        assert_eq!(status.name, "api");
        assert_eq!(status.results.len(), 1);
        assert_eq!(status.events.len(), 2);
        assert_eq!(status.events[0].event_type, EventType::Start);
        assert_eq!(status.events[0].timestamp, now - TimeDelta::milliseconds(100));
        assert_eq!(status.events[1].event_type, EventType::Unhealthy);
    }

    #[test]
    fn test_events_only_on_transitions() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("core", "api");
        let now = Utc::now();
        for i in 0..5 {
            store.insert(&ep, &result_at(now + TimeDelta::seconds(i), true)).unwrap();
        }
        assert_eq!(store.get_by_key(&ep.key(), &all()).unwrap().events.len(), 2);

        store.insert(&ep, &result_at(now + TimeDelta::seconds(10), false)).unwrap();
        store.insert(&ep, &result_at(now + TimeDelta::seconds(11), false)).unwrap();
        store.insert(&ep, &result_at(now + TimeDelta::seconds(12), true)).unwrap();
        let events = store.get_by_key(&ep.key(), &all()).unwrap().events;
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::Start, EventType::Healthy, EventType::Unhealthy, EventType::Healthy]
        );
    }

    #[test]
    fn test_caps_hold_after_every_insert() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "flappy");
        let now = Utc::now();
        for i in 0..(MAXIMUM_NUMBER_OF_RESULTS as i64 * 3) {
            store.insert(&ep, &result_at(now + TimeDelta::seconds(i), i % 2 == 0)).unwrap();
            let status = store.get_by_key(&ep.key(), &all()).unwrap();
            assert!(status.results.len() <= MAXIMUM_NUMBER_OF_RESULTS);
            assert!(status.events.len() <= MAXIMUM_NUMBER_OF_EVENTS);
            assert_eq!(status.events[0].event_type, EventType::Start);
        }
        let status = store.get_by_key(&ep.key(), &all()).unwrap();
        assert_eq!(status.results.len(), MAXIMUM_NUMBER_OF_RESULTS);
        assert_eq!(status.events.len(), MAXIMUM_NUMBER_OF_EVENTS);
        // Oldest results were dropped first and order is preserved
        let last = MAXIMUM_NUMBER_OF_RESULTS as i64 * 3 - 1;
        assert_eq!(status.results.last().unwrap().timestamp, now + TimeDelta::seconds(last));
        assert!(status.results.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_paging_results() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "paged");
        let now = Utc::now();
        for i in 0..25 {
            store.insert(&ep, &result_at(now + TimeDelta::seconds(i), true)).unwrap();
        }
        let page = |p, size| {
            store
                .get_by_key(&ep.key(), &PagingParams::new().with_results(p, size))
                .unwrap()
                .results
        };
        let first = page(1, 10);
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].timestamp, now + TimeDelta::seconds(15));
        assert_eq!(first[9].timestamp, now + TimeDelta::seconds(24));
        let third = page(3, 10);
        assert_eq!(third.len(), 5);
        assert_eq!(third[0].timestamp, now);
        assert!(page(4, 10).is_empty());
        assert!(page(-1, 20).is_empty());
        assert!(page(1, -1).is_empty());
    }

    #[test]
    fn test_returned_status_is_a_copy() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "copy");
        store.insert(&ep, &result_at(Utc::now(), true)).unwrap();

        let mut copy = store.get_by_key(&ep.key(), &all()).unwrap();
        copy.results.clear();
        copy.events.clear();
        copy.successes_in_a_row = 42;

        let fresh = store.get_by_key(&ep.key(), &all()).unwrap();
        assert_eq!(fresh.results.len(), 1);
        assert_eq!(fresh.events.len(), 2);
        assert_eq!(fresh.successes_in_a_row, 1);
    }

    #[test]
    fn test_get_all_sorted_by_key() {
        let store = MemoryStore::new();
        for name in ["zeta", "alpha", "mid"] {
            store.insert(&Endpoint::new("", name), &result_at(Utc::now(), true)).unwrap();
        }
        let keys: Vec<_> = store.get_all(&PagingParams::new()).unwrap().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["_alpha", "_mid", "_zeta"]);
    }

    #[test]
    fn test_unknown_key_and_empty_history_are_distinct() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "known");
        store.insert(&ep, &result_at(Utc::now(), true)).unwrap();
        assert!(matches!(
            store.get_by_key("_unknown", &all()),
            Err(StoreError::EndpointNotFound)
        ));
        let status = store.get_by_key(&ep.key(), &PagingParams::new()).unwrap();
        assert!(status.results.is_empty());
    }

    #[test]
    fn test_uptime_queries() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "uptime");
        let now = Utc::now();
        store.insert(&ep, &result_at(now, true)).unwrap();
        store.insert(&ep, &result_at(now, false)).unwrap();

        let from = now - TimeDelta::hours(1);
        assert_eq!(store.uptime(&ep.key(), from, now).unwrap(), 0.5);
        assert_eq!(store.average_response_time(&ep.key(), from, now).unwrap(), 100);
        assert_eq!(store.hourly_average_response_time(&ep.key(), from, now).unwrap().len(), 1);
        assert!(matches!(store.uptime(&ep.key(), now, from), Err(StoreError::InvalidTimeRange)));
        assert!(matches!(
            store.average_response_time(&ep.key(), now, from),
            Err(StoreError::InvalidTimeRange)
        ));
        assert!(matches!(store.uptime("_nope", from, now), Err(StoreError::EndpointNotFound)));
        assert!(matches!(
            store.average_response_time("_nope", from, now),
            Err(StoreError::EndpointNotFound)
        ));
    }

    #[test]
    fn test_delete_not_in_keys() {
        let store = MemoryStore::new();
        let k1 = Endpoint::new("", "k1");
        let k2 = Endpoint::new("", "k2");
        store.insert(&k1, &result_at(Utc::now(), true)).unwrap();
        store.insert(&k2, &result_at(Utc::now(), true)).unwrap();

        assert_eq!(store.delete_not_in_keys(&[k1.key()]), 1);
        assert!(store.get_by_key(&k1.key(), &all()).is_ok());
        assert!(matches!(store.get_by_key(&k2.key(), &all()), Err(StoreError::EndpointNotFound)));
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        store.insert(&Endpoint::new("", "a"), &result_at(Utc::now(), true)).unwrap();
        store.clear();
        assert!(store.get_all(&all()).unwrap().is_empty());
    }

    #[test]
    fn test_triggered_alerts_are_not_persisted() {
        let store = MemoryStore::new();
        let ep = Endpoint::new("", "a");
        let alert = Alert::new("log");
        store.upsert_triggered_alert(&ep, &alert, &TriggeredAlert::default()).unwrap();
        assert_eq!(store.get_triggered_alert(&ep, &alert).unwrap(), None);
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let ep = Endpoint::new("", &format!("ep-{}", t % 2));
                    for _ in 0..50 {
                        store.insert(&ep, &result_at(Utc::now(), true)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let now = Utc::now();
        for name in ["ep-0", "ep-1"] {
            let key = Endpoint::new("", name).key();
            let status = store.get_by_key(&key, &all()).unwrap();
            assert_eq!(status.results.len(), MAXIMUM_NUMBER_OF_RESULTS);
            assert_eq!(status.successes_in_a_row, 200);
            assert_eq!(store.uptime(&key, now - TimeDelta::hours(2), now).unwrap(), 1.0);
        }
    }
}
