//! healthtrail - endpoint health monitoring service.

use healthtrail::alerting::{AlertEngine, AlertSender, Dispatcher, LogSender, WebhookSender};
use healthtrail::config::{MonitorConfig, ServerConfig};
use healthtrail::probe::HttpProbe;
use healthtrail::scheduler::{MonitorContext, Scheduler};
use healthtrail::storage::open_store;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("healthtrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    let monitor = MonitorConfig::from_file(&cfg.config_path)?;
    tracing::info!(
        "Starting healthtrail with {} endpoints from {}",
        monitor.endpoints.len(),
        cfg.config_path
    );

    // Initialize storage
    let store = open_store(cfg.storage_type, &cfg.db_path, cfg.cache_ttl)?;
    tracing::info!("Using {:?} storage", cfg.storage_type);

    // Alert delivery
    let mut dispatcher = Dispatcher::new().with("log", Arc::new(LogSender));
    if let Some(webhook) = &monitor.alerting.webhook {
        let sender = WebhookSender::new(webhook.url.clone(), Duration::from_secs(webhook.timeout_secs))?;
        dispatcher = dispatcher.with("webhook", Arc::new(sender));
    }
    for endpoint in &monitor.endpoints {
        for alert in endpoint.enabled_alerts() {
            if !dispatcher.supports(&alert.alert_type) {
                tracing::warn!(
                    "No provider configured for {} alert of {}, it will not be sent",
                    alert.alert_type,
                    endpoint.key()
                );
            }
        }
    }
    let sender: Arc<dyn AlertSender> = Arc::new(dispatcher);
    let engine = Arc::new(AlertEngine::new(store.clone(), sender));

    // Start scheduler
    let scheduler = Scheduler::new(
        MonitorContext {
            store: store.clone(),
            engine,
            probe: Arc::new(HttpProbe::new()),
            maintenance: monitor.maintenance,
        },
        cfg.monitoring_lock,
    );
    scheduler.start(monitor.endpoints).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;
    store.close();

    Ok(())
}
