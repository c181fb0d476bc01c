//! Tidewatch alerting service
//!
//! Run with: cargo run
//!
//! Commands:
//! - (none): run the alert scheduler until Ctrl-C
//! - backfill <start> <end>: re-evaluate every alert between two RFC 3339 times
//! - clear: delete all stored alert results
//!
//! Environment variables:
//! - TIDEWATCH_CONTENT_DIR: Root of the alert definitions (default: ./content)
//! - TIDEWATCH_ALERT_PATTERN: Definition file pattern (default: */alerts.yaml)
//! - TIDEWATCH_CLICKHOUSE_URL: ClickHouse HTTP interface (default: http://127.0.0.1:8123)
//! - TIDEWATCH_CLICKHOUSE_USER / _PASSWORD / _DATABASE: ClickHouse credentials
//! - TIDEWATCH_QUERY_TIMEOUT_SECS: Query timeout (default: 30)
//! - TIDEWATCH_RESULT_LOG: JSON lines file for results (default: ClickHouse table)
//! - TIDEWATCH_NOTIFY_URL: Webhook for state changes (default: log only)
//! - TIDEWATCH_NOTIFY_GROUP: Group sent with every notification (default: default)
//! - RUST_LOG: Log level (default: tidewatch=info)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tidewatch::alerts::{
    AlertEvaluator, AlertManager, AlertNotifier, AlertResultStore, AlertScheduler,
    BackfillReconciler, ClickHouseResultLog, DirFs, FileResultLog, LogNotifier, ResultLog,
    WebhookNotifier,
};
use tidewatch::backend::clickhouse::ClickHouseBackend;
use tidewatch::backend::QueryBackend;
use tidewatch::clock::SystemClock;
use tidewatch::config::{AppConfig, ResultLogTarget};
use tidewatch::schedule::CronTicks;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidewatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    let args: Vec<String> = std::env::args().collect();

    tracing::info!("Tidewatch configuration:");
    tracing::info!("  Content dir: {}", config.content_dir.display());
    tracing::info!("  Alert pattern: {}", config.alert_pattern);
    tracing::info!("  ClickHouse: {}", config.clickhouse.url);

    let backend: Arc<dyn QueryBackend> = Arc::new(ClickHouseBackend::new(config.clickhouse.clone())?);

    let log: Arc<dyn ResultLog> = match &config.result_log {
        ResultLogTarget::File(path) => {
            tracing::info!("  Result log: {}", path.display());
            Arc::new(FileResultLog::new(path))
        }
        ResultLogTarget::ClickHouse => {
            tracing::info!("  Result log: ClickHouse table");
            let log = ClickHouseResultLog::new(Arc::clone(&backend));
            log.ensure_table().await?;
            Arc::new(log)
        }
    };
    let store = Arc::new(AlertResultStore::new(log));

    let manager = Arc::new(AlertManager::with_pattern(
        Arc::new(DirFs::new(&config.content_dir)),
        config.alert_pattern.clone(),
    ));

    match args.get(1).map(String::as_str) {
        None | Some("run") => run_scheduler(&config, backend, store, &manager).await,
        Some("backfill") => {
            let (Some(start), Some(end)) = (args.get(2), args.get(3)) else {
                return Err("usage: tidewatch backfill <start> <end>".into());
            };
            let start = parse_time(start)?;
            let end = parse_time(end)?;

            store.load_status_into_memory().await?;
            let reconciler = BackfillReconciler::new(backend, store, Arc::new(CronTicks::new()))
                .with_manager(manager);
            let count = reconciler.evaluate_alerts(start, end).await?;
            tracing::info!(alerts = count, "Backfill finished");
            Ok(())
        }
        Some("clear") => {
            store.clear_all().await?;
            tracing::info!("All alert results cleared");
            Ok(())
        }
        Some(other) => Err(format!("unknown command: {}", other).into()),
    }
}

async fn run_scheduler(
    config: &AppConfig,
    backend: Arc<dyn QueryBackend>,
    store: Arc<AlertResultStore>,
    manager: &AlertManager,
) -> Result<(), Box<dyn std::error::Error>> {
    let notifier: Arc<dyn AlertNotifier> = match &config.notify_url {
        Some(url) => {
            tracing::info!("  Notify: {}", url);
            Arc::new(WebhookNotifier::new(url.clone(), config.notify_group.clone()))
        }
        None => {
            tracing::warn!("TIDEWATCH_NOTIFY_URL not set, alert changes are only logged");
            Arc::new(LogNotifier)
        }
    };

    let count = manager.discover()?;
    tracing::info!(alerts = count, "Alert definitions loaded");

    let evaluator = AlertEvaluator::new(backend, Arc::new(SystemClock));
    let mut scheduler = AlertScheduler::new(evaluator, store, notifier, Arc::new(CronTicks::new()));
    scheduler.start(manager.definitions()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;
    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid time '{}': {}", s, e).into())
}
