//! Alert state machine.
//!
//! After each stored result, every enabled alert of the endpoint is either
//! `Resolved` or `Triggered`. The streak counters come from the store, which
//! updates them as part of the insert; the engine only decides transitions
//! and hands notifications to an [`AlertSender`].

mod sender;

pub use sender::*;

use crate::endpoint::{Alert, CheckResult, Endpoint, Streak};
use crate::storage::{PagingParams, Store, StoreError, TriggeredAlert};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Whether an alert is currently firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Resolved,
    Triggered,
}

/// What to do with an alert after a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Send the trigger notification; the alert fires once it was delivered
    Trigger,
    /// Clear the alert, sending the resolve notification only if `notify`
    Resolve { notify: bool },
    /// Still triggered; the persisted success streak should be refreshed
    Pending,
}

/// Decide the action for an alert in `state` given the endpoint's streak
/// after a result with outcome `success`.
pub fn decide(state: AlertState, alert: &Alert, streak: Streak, success: bool) -> Action {
    match state {
        AlertState::Resolved if !success && streak.failures_in_a_row >= alert.failure_threshold => {
            Action::Trigger
        }
        AlertState::Resolved => Action::None,
        AlertState::Triggered if success && streak.successes_in_a_row >= alert.success_threshold => {
            Action::Resolve {
                notify: alert.send_on_resolved,
            }
        }
        AlertState::Triggered => Action::Pending,
    }
}

type TriggeredByChecksum = HashMap<String, TriggeredAlert>;

/// Drives alerts from stored results.
///
/// Triggered alerts are tracked in process, keyed by endpoint key and alert
/// checksum, and mirrored to the store so a durable backend can restore them
/// after a restart. Results of one endpoint are handled one at a time, so
/// overlapping probes cannot both trigger the same alert.
pub struct AlertEngine {
    store: Arc<dyn Store>,
    sender: Arc<dyn AlertSender>,
    triggered: Mutex<HashMap<String, TriggeredByChecksum>>,
    handling: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, sender: Arc<dyn AlertSender>) -> Self {
        Self {
            store,
            sender,
            triggered: Mutex::new(HashMap::new()),
            handling: Mutex::new(HashMap::new()),
        }
    }

    /// Per-endpoint lock held across evaluation, delivery and recording.
    fn handling_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.handling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn triggered(&self) -> MutexGuard<'_, HashMap<String, TriggeredByChecksum>> {
        self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load persisted triggered alerts the first time an endpoint is seen.
    fn hydrate(&self, endpoint: &Endpoint) {
        let key = endpoint.key();
        if self.triggered().contains_key(&key) {
            return;
        }
        let mut restored = TriggeredByChecksum::new();
        for alert in endpoint.enabled_alerts() {
            match self.store.get_triggered_alert(endpoint, alert) {
                Ok(Some(triggered)) => {
                    restored.insert(alert.checksum(), triggered);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    "AlertEngine: Failed to load triggered alert for {}: {}",
                    key,
                    e
                ),
            }
        }
        if !restored.is_empty() {
            tracing::info!("AlertEngine: Restored {} triggered alert(s) for {}", restored.len(), key);
        }
        self.triggered().entry(key).or_insert(restored);
    }

    fn record(&self, key: &str, alert: &Alert) -> Option<TriggeredAlert> {
        self.triggered()
            .get(key)
            .and_then(|alerts| alerts.get(&alert.checksum()))
            .cloned()
    }

    fn set_record(&self, key: &str, alert: &Alert, record: Option<TriggeredAlert>) {
        let mut triggered = self.triggered();
        let alerts = triggered.entry(key.to_string()).or_default();
        match record {
            Some(record) => {
                alerts.insert(alert.checksum(), record);
            }
            None => {
                alerts.remove(&alert.checksum());
            }
        }
    }

    fn streak(&self, endpoint: &Endpoint) -> Result<Streak, StoreError> {
        Ok(self
            .store
            .get_by_key(&endpoint.key(), &PagingParams::default())?
            .streak())
    }

    pub fn is_triggered(&self, endpoint: &Endpoint, alert: &Alert) -> bool {
        self.hydrate(endpoint);
        self.record(&endpoint.key(), alert).is_some()
    }

    /// Action for `alert` following `result`, which must already be stored.
    pub fn evaluate(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        result: &CheckResult,
    ) -> Result<Action, StoreError> {
        let streak = self.streak(endpoint)?;
        Ok(self.evaluate_with(endpoint, alert, streak, result.success))
    }

    fn evaluate_with(&self, endpoint: &Endpoint, alert: &Alert, streak: Streak, success: bool) -> Action {
        let state = if self.is_triggered(endpoint, alert) {
            AlertState::Triggered
        } else {
            AlertState::Resolved
        };
        decide(state, alert, streak, success)
    }

    /// Run every enabled alert of `endpoint` against `result`, which must
    /// already be stored. Nothing is sent or recorded during maintenance.
    pub async fn handle(&self, endpoint: &Endpoint, result: &CheckResult, under_maintenance: bool) {
        if endpoint.enabled_alerts().next().is_none() {
            return;
        }
        let key = endpoint.key();
        if under_maintenance {
            tracing::debug!("AlertEngine: {} is under maintenance, not alerting", key);
            return;
        }
        let lock = self.handling_lock(&key);
        let _guard = lock.lock().await;
        let streak = match self.streak(endpoint) {
            Ok(streak) => streak,
            Err(e) => {
                tracing::error!("AlertEngine: Failed to read streak for {}: {}", key, e);
                return;
            }
        };

        for alert in endpoint.enabled_alerts() {
            match self.evaluate_with(endpoint, alert, streak, result.success) {
                Action::None => {}
                Action::Trigger => self.trigger(endpoint, alert, result).await,
                Action::Resolve { notify } => self.resolve(endpoint, alert, result, notify).await,
                Action::Pending => self.refresh_streak(endpoint, alert, streak.successes_in_a_row),
            }
        }
    }

    async fn trigger(&self, endpoint: &Endpoint, alert: &Alert, result: &CheckResult) {
        let key = endpoint.key();
        tracing::info!(
            "AlertEngine: Sending {} alert for {} because alert with description='{}' has been triggered",
            alert.alert_type,
            key,
            alert.description()
        );
        // Left resolved on failure so the next failing result tries again
        let resolve_key = match self.sender.send(endpoint, alert, result, false, None).await {
            Ok(resolve_key) => resolve_key,
            Err(e) => {
                tracing::error!("AlertEngine: Failed to send {} alert for {}: {}", alert.alert_type, key, e);
                return;
            }
        };
        let record = TriggeredAlert {
            resolve_key: resolve_key.unwrap_or_default(),
            successes_in_a_row: 0,
        };
        if let Err(e) = self.store.upsert_triggered_alert(endpoint, alert, &record) {
            tracing::error!("AlertEngine: Failed to persist triggered alert for {}: {}", key, e);
        }
        self.set_record(&key, alert, Some(record));
    }

    async fn resolve(&self, endpoint: &Endpoint, alert: &Alert, result: &CheckResult, notify: bool) {
        let key = endpoint.key();
        let record = self.record(&key, alert).unwrap_or_default();
        self.set_record(&key, alert, None);
        if let Err(e) = self.store.delete_triggered_alert(endpoint, alert) {
            tracing::error!("AlertEngine: Failed to delete triggered alert for {}: {}", key, e);
        }
        if !notify {
            tracing::info!("AlertEngine: Alert with description='{}' for {} resolved", alert.description(), key);
            return;
        }
        tracing::info!(
            "AlertEngine: Sending {} alert for {} because alert with description='{}' has been resolved",
            alert.alert_type,
            key,
            alert.description()
        );
        let resolve_key = Some(record.resolve_key.as_str()).filter(|k| !k.is_empty());
        if let Err(e) = self.sender.send(endpoint, alert, result, true, resolve_key).await {
            tracing::error!("AlertEngine: Failed to send {} resolve for {}: {}", alert.alert_type, key, e);
        }
    }

    fn refresh_streak(&self, endpoint: &Endpoint, alert: &Alert, successes_in_a_row: u32) {
        let key = endpoint.key();
        let Some(mut record) = self.record(&key, alert) else {
            return;
        };
        if record.successes_in_a_row == successes_in_a_row {
            return;
        }
        record.successes_in_a_row = successes_in_a_row;
        if let Err(e) = self.store.upsert_triggered_alert(endpoint, alert, &record) {
            tracing::error!("AlertEngine: Failed to update triggered alert for {}: {}", key, e);
        }
        self.set_record(&key, alert, Some(record));
    }

    /// Forget triggered alerts of `endpoint` that no enabled alert matches
    /// anymore; returns how many persisted records were deleted.
    pub fn reconcile(&self, endpoint: &Endpoint) -> usize {
        let checksums: Vec<String> = endpoint.enabled_alerts().map(Alert::checksum).collect();
        if let Some(alerts) = self.triggered().get_mut(&endpoint.key()) {
            alerts.retain(|checksum, _| checksums.contains(checksum));
        }
        let deleted = self
            .store
            .delete_triggered_alerts_not_in_checksums(endpoint, &checksums);
        if deleted > 0 {
            tracing::info!(
                "AlertEngine: Deleted {} stale triggered alert(s) for {}",
                deleted,
                endpoint.key()
            );
        }
        deleted
    }
}
