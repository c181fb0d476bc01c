//! Process configuration from environment variables

use std::path::PathBuf;
use std::time::Duration;

use crate::alerts::manager::DEFAULT_ALERT_PATTERN;
use crate::backend::clickhouse::ClickHouseConfig;

/// Where alert results are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLogTarget {
    /// `tidewatch_alert_events` table on the query backend
    ClickHouse,
    /// JSON lines file
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root the alert pattern is matched against
    pub content_dir: PathBuf,
    pub alert_pattern: String,
    pub clickhouse: ClickHouseConfig,
    pub result_log: ResultLogTarget,
    /// Webhook for state changes; logged only when unset
    pub notify_url: Option<String>,
    pub notify_group: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            content_dir: PathBuf::from("./content"),
            alert_pattern: DEFAULT_ALERT_PATTERN.to_string(),
            clickhouse: ClickHouseConfig::default(),
            result_log: ResultLogTarget::ClickHouse,
            notify_url: None,
            notify_group: "default".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let timeout = var("TIDEWATCH_QUERY_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.clickhouse.timeout);

        Self {
            content_dir: var("TIDEWATCH_CONTENT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.content_dir),
            alert_pattern: var("TIDEWATCH_ALERT_PATTERN").unwrap_or(defaults.alert_pattern),
            clickhouse: ClickHouseConfig {
                url: var("TIDEWATCH_CLICKHOUSE_URL").unwrap_or(defaults.clickhouse.url),
                user: var("TIDEWATCH_CLICKHOUSE_USER"),
                password: var("TIDEWATCH_CLICKHOUSE_PASSWORD"),
                database: var("TIDEWATCH_CLICKHOUSE_DATABASE"),
                timeout,
            },
            result_log: var("TIDEWATCH_RESULT_LOG")
                .map(|path| ResultLogTarget::File(PathBuf::from(path)))
                .unwrap_or(ResultLogTarget::ClickHouse),
            notify_url: var("TIDEWATCH_NOTIFY_URL"),
            notify_group: var("TIDEWATCH_NOTIFY_GROUP").unwrap_or(defaults.notify_group),
        }
    }
}
