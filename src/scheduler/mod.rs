//! Scheduler running one monitoring loop per endpoint.

use crate::alerting::AlertEngine;
use crate::endpoint::{CheckResult, Endpoint};
use crate::maintenance::MaintenanceWindow;
use crate::probe::Probe;
use crate::storage::Store;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};

/// Everything a monitoring loop needs, shared by all loops.
pub struct MonitorContext {
    pub store: Arc<dyn Store>,
    pub engine: Arc<AlertEngine>,
    pub probe: Arc<dyn Probe>,
    /// Windows applying to every endpoint
    pub maintenance: Vec<MaintenanceWindow>,
}

/// The main scheduler that orchestrates endpoint monitoring.
pub struct Scheduler {
    context: Arc<MonitorContext>,
    monitoring_lock: bool,
    stop_chans: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

impl Scheduler {
    /// With `monitoring_lock`, a tick is skipped while the endpoint's previous
    /// probe is still running; otherwise probes may overlap.
    pub fn new(context: MonitorContext, monitoring_lock: bool) -> Self {
        Self {
            context: Arc::new(context),
            monitoring_lock,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop state left over from endpoints and alerts that are no longer
    /// configured, then start monitoring every endpoint.
    pub async fn start(&self, endpoints: Vec<Endpoint>) {
        let keys: Vec<String> = endpoints.iter().map(Endpoint::key).collect();
        let removed = self.context.store.delete_not_in_keys(&keys);
        if removed > 0 {
            tracing::info!("Scheduler: Removed {} endpoint(s) no longer configured", removed);
        }
        for endpoint in &endpoints {
            self.context.engine.reconcile(endpoint);
        }

        tracing::info!("Starting scheduler with {} endpoints", endpoints.len());
        for endpoint in endpoints {
            self.add_endpoint(endpoint).await;
        }
    }

    /// Start monitoring an endpoint; no-op if its key is already monitored.
    pub async fn add_endpoint(&self, endpoint: Endpoint) {
        let key = endpoint.key();
        let mut stop_chans = self.stop_chans.write().await;
        if stop_chans.contains_key(&key) {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(key.clone(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding endpoint {}", key);

        let context = self.context.clone();
        let monitoring_lock = self.monitoring_lock;
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            run_monitor_loop(context, Arc::new(endpoint), monitoring_lock, stop_tx.subscribe()).await;

            // Clean up when done, unless the key was re-added meanwhile
            let mut chans = stop_chans.write().await;
            if chans.get(&key).is_some_and(|tx| tx.same_channel(&stop_tx)) {
                chans.remove(&key);
            }
        });
    }

    /// Stop monitoring the endpoint with `key`.
    pub async fn remove_endpoint(&self, key: &str) {
        let mut stop_chans = self.stop_chans.write().await;
        if let Some(stop_tx) = stop_chans.remove(key) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Removed endpoint {}", key);
        }
    }

    /// Keys of the endpoints being monitored, sorted.
    pub async fn monitored(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.stop_chans.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop every loop. Probes already in flight still complete.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
        tracing::info!("Scheduler: Stopped");
    }
}

/// Whether alerting for `endpoint` is suppressed at `now`.
pub fn under_maintenance(global: &[MaintenanceWindow], endpoint: &Endpoint, now: DateTime<Utc>) -> bool {
    global
        .iter()
        .chain(endpoint.maintenance_windows.iter())
        .any(|window| window.is_active(now))
}

/// Probe `endpoint` once, store the result and run its alerts.
pub async fn execute_endpoint(context: &MonitorContext, endpoint: &Endpoint) -> CheckResult {
    let key = endpoint.key();
    let result = context.probe.probe(endpoint).await;
    tracing::info!(
        "Monitored {}: success={} errors={} duration={:?}",
        key,
        result.success,
        result.errors.len(),
        result.duration
    );

    // The store logs the failure; alerts would only see a stale streak
    if context.store.insert(endpoint, &result).is_err() {
        return result;
    }

    let maintenance = under_maintenance(&context.maintenance, endpoint, Utc::now());
    context.engine.handle(endpoint, &result, maintenance).await;
    result
}

/// Run the monitoring loop for a single endpoint.
async fn run_monitor_loop(
    context: Arc<MonitorContext>,
    endpoint: Arc<Endpoint>,
    monitoring_lock: bool,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let lock = Arc::new(Semaphore::new(1));
    let mut interval = tokio::time::interval(endpoint.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = if monitoring_lock {
                    match lock.clone().try_acquire_owned() {
                        Ok(p) => Some(p),
                        Err(_) => {
                            tracing::warn!("Skipping probe for {}: previous probe still running", endpoint.key());
                            continue;
                        }
                    }
                } else {
                    None
                };

                let context = context.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done
                    execute_endpoint(&context, &endpoint).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{AlertSender, SendError};
    use crate::endpoint::Alert;
    use crate::storage::{MemoryStore, PagingParams};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always reports the same outcome.
    struct FixedProbe {
        success: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for FixedProbe {
        async fn probe(&self, _endpoint: &Endpoint) -> CheckResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CheckResult::new(Utc::now(), self.success, Duration::from_millis(3))
        }
    }

    #[derive(Default)]
    struct CountingSender {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl AlertSender for CountingSender {
        async fn send(
            &self,
            _endpoint: &Endpoint,
            _alert: &Alert,
            _result: &CheckResult,
            _resolved: bool,
            _resolve_key: Option<&str>,
        ) -> Result<Option<String>, SendError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn context(success: bool, maintenance: Vec<MaintenanceWindow>) -> (MonitorContext, Arc<CountingSender>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sender = Arc::new(CountingSender::default());
        let engine = Arc::new(AlertEngine::new(store.clone(), sender.clone()));
        let probe = Arc::new(FixedProbe {
            success,
            calls: AtomicUsize::new(0),
        });
        let context = MonitorContext {
            store,
            engine,
            probe,
            maintenance,
        };
        (context, sender)
    }

    fn alerting_endpoint() -> Endpoint {
        let mut ep = Endpoint::new("core", "api");
        let mut alert = Alert::new("log");
        alert.failure_threshold = 2;
        ep.alerts.push(alert);
        ep
    }

    #[tokio::test]
    async fn test_execute_endpoint_stores_and_alerts() {
        let (context, sender) = context(false, Vec::new());
        let ep = alerting_endpoint();

        execute_endpoint(&context, &ep).await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
        execute_endpoint(&context, &ep).await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);

        let status = context
            .store
            .get_by_key(&ep.key(), &PagingParams::new().with_results(1, 10))
            .unwrap();
        assert_eq!(status.results.len(), 2);
        assert_eq!(status.failures_in_a_row, 2);
    }

    #[tokio::test]
    async fn test_global_maintenance_suppresses_alerts() {
        let (context, sender) = context(false, vec![MaintenanceWindow::new("00:00", 24 * 60)]);
        let ep = alerting_endpoint();
        for _ in 0..3 {
            execute_endpoint(&context, &ep).await;
        }
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_under_maintenance() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 2, 30, 0).unwrap();
        let mut ep = Endpoint::new("", "api");
        assert!(!under_maintenance(&[], &ep, now));
        assert!(under_maintenance(&[MaintenanceWindow::new("02:00", 60)], &ep, now));

        ep.maintenance_windows.push(MaintenanceWindow::new("02:15", 30));
        assert!(under_maintenance(&[MaintenanceWindow::new("10:00", 60)], &ep, now));
    }

    #[tokio::test]
    async fn test_start_reconciles_and_monitors() {
        let (context, _sender) = context(true, Vec::new());
        let stale = Endpoint::new("", "removed");
        context
            .store
            .insert(&stale, &CheckResult::new(Utc::now(), true, Duration::from_millis(1)))
            .unwrap();
        let store = context.store.clone();
        let scheduler = Scheduler::new(context, true);

        let ep = Endpoint::new("core", "api");
        scheduler.start(vec![ep.clone()]).await;
        assert!(store.get_by_key(&stale.key(), &PagingParams::new()).is_err());
        assert_eq!(scheduler.monitored().await, vec![ep.key()]);

        // The first tick fires right after the startup jitter
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.get_by_key(&ep.key(), &PagingParams::new()).is_ok());

        scheduler.remove_endpoint(&ep.key()).await;
        assert!(scheduler.monitored().await.is_empty());
        scheduler.stop().await;
    }
}
