//! Durable, append-only log of alert results
//!
//! Every persisted result becomes one `(group, key, timestamp, status, message)`
//! record. The current status of an alert is the record with the greatest
//! timestamp for its id.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::definition::AlertId;
use super::evaluator::{AlertState, UnknownStateError};
use crate::backend::{query_rows, Params, QueryBackend, QueryError};
use crate::clock::{format_db_time, parse_db_time};

/// One durably stored alert result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEventRecord {
    pub alert_id_group: String,
    pub alert_id_key: String,
    #[serde(with = "db_time_serde")]
    pub timestamp: DateTime<Utc>,
    pub status: AlertState,
    pub message: String,
}

impl AlertEventRecord {
    pub fn alert_id(&self) -> AlertId {
        AlertId::new(self.alert_id_group.clone(), self.alert_id_key.clone())
    }
}

/// Append-only result storage
pub trait ResultLog: Send + Sync {
    fn append<'a>(&'a self, record: &'a AlertEventRecord) -> BoxFuture<'a, Result<(), LogError>>;

    /// Newest record per alert id, ordered by id
    fn latest_per_alert(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>>;

    /// Every record, ordered by id then timestamp
    fn all_records(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>>;

    /// Drop every record
    fn truncate(&self) -> BoxFuture<'_, Result<(), LogError>>;
}

/// Keep the newest record of each alert; on equal timestamps the later one wins
fn latest_by_alert(records: Vec<AlertEventRecord>) -> Vec<AlertEventRecord> {
    let mut latest: HashMap<AlertId, AlertEventRecord> = HashMap::new();
    for record in records {
        let id = record.alert_id();
        let newer = latest
            .get(&id)
            .map_or(true, |existing| record.timestamp >= existing.timestamp);
        if newer {
            latest.insert(id, record);
        }
    }

    let mut latest: Vec<_> = latest.into_values().collect();
    latest.sort_by(|a, b| {
        (&a.alert_id_group, &a.alert_id_key).cmp(&(&b.alert_id_group, &b.alert_id_key))
    });
    latest
}

fn sorted_history(mut records: Vec<AlertEventRecord>) -> Vec<AlertEventRecord> {
    // stable sort keeps append order for equal timestamps
    records.sort_by(|a, b| {
        (&a.alert_id_group, &a.alert_id_key, a.timestamp)
            .cmp(&(&b.alert_id_group, &b.alert_id_key, b.timestamp))
    });
    records
}

/// Result log kept in process memory
#[derive(Debug, Default)]
pub struct MemoryResultLog {
    records: Mutex<Vec<AlertEventRecord>>,
}

impl MemoryResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultLog for MemoryResultLog {
    fn append<'a>(&'a self, record: &'a AlertEventRecord) -> BoxFuture<'a, Result<(), LogError>> {
        Box::pin(async move {
            self.records.lock().push(record.clone());
            Ok(())
        })
    }

    fn latest_per_alert(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move { Ok(latest_by_alert(self.records.lock().clone())) })
    }

    fn all_records(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move { Ok(sorted_history(self.records.lock().clone())) })
    }

    fn truncate(&self) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            self.records.lock().clear();
            Ok(())
        })
    }
}

/// Result log stored as JSON lines in a local file
#[derive(Debug)]
pub struct FileResultLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileResultLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<AlertEventRecord>, LogError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let torn_tail = !contents.is_empty() && !contents.ends_with('\n');
        let last = contents.lines().count().saturating_sub(1);

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // an interrupted append; it never counted as persisted
                Err(e) if torn_tail && idx == last => {
                    tracing::warn!(path = %self.path.display(), error = %e, "ignoring torn last line");
                }
                Err(e) => {
                    return Err(LogError::Corrupt {
                        location: format!("{}:{}", self.path.display(), idx + 1),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

/// Cut an unterminated last line left behind by an interrupted append
async fn drop_torn_tail(file: &mut tokio::fs::File) -> std::io::Result<()> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut contents).await?;
    if contents.ends_with(b"\n") {
        return Ok(());
    }

    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    tracing::warn!(dropped_bytes = contents.len() - keep, "dropping torn last line of result log");
    file.set_len(keep as u64).await?;
    Ok(())
}

impl ResultLog for FileResultLog {
    fn append<'a>(&'a self, record: &'a AlertEventRecord) -> BoxFuture<'a, Result<(), LogError>> {
        Box::pin(async move {
            let mut line = serde_json::to_string(record).map_err(|e| LogError::Corrupt {
                location: record.alert_id().to_string(),
                reason: e.to_string(),
            })?;
            line.push('\n');

            let _guard = self.write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.path)
                .await?;
            drop_torn_tail(&mut file).await?;
            file.write_all(line.as_bytes()).await?;
            file.sync_data().await?;
            Ok(())
        })
    }

    fn latest_per_alert(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move { Ok(latest_by_alert(self.read_all().await?)) })
    }

    fn all_records(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move { Ok(sorted_history(self.read_all().await?)) })
    }

    fn truncate(&self) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            tokio::fs::write(&self.path, b"").await?;
            Ok(())
        })
    }
}

const CREATE_TABLE_QUERY: &str = "
CREATE TABLE IF NOT EXISTS tidewatch_alert_events
(
    alert_id_group LowCardinality(String),
    alert_id_key   LowCardinality(String),
    timestamp      DateTime('UTC'),
    status         LowCardinality(String),
    message        String
)
ENGINE = MergeTree
ORDER BY (alert_id_group, alert_id_key, timestamp)
";

const LOAD_QUERY: &str = "
SELECT
    alert_id_group,
    alert_id_key,
    max(timestamp) AS latest_timestamp,
    argMax(status, timestamp) AS latest_status,
    argMax(message, timestamp) AS latest_message
FROM tidewatch_alert_events
GROUP BY alert_id_group, alert_id_key
ORDER BY alert_id_group, alert_id_key
";

const HISTORY_QUERY: &str = "
SELECT alert_id_group, alert_id_key, timestamp, status, message
FROM tidewatch_alert_events
ORDER BY alert_id_group, alert_id_key, timestamp
";

const PERSIST_RESULT_QUERY: &str = "
INSERT INTO tidewatch_alert_events(alert_id_group, alert_id_key, timestamp, status, message)
VALUES({alert_id_group:String}, {alert_id_key:String}, {timestamp:DateTime('UTC')}, {status:String}, {message:String})
";

const TRUNCATE_TABLE_QUERY: &str = "TRUNCATE TABLE tidewatch_alert_events";

#[derive(Debug, Deserialize)]
struct LatestStatusRow {
    alert_id_group: String,
    alert_id_key: String,
    latest_timestamp: String,
    latest_status: String,
    latest_message: String,
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    alert_id_group: String,
    alert_id_key: String,
    timestamp: String,
    status: String,
    message: String,
}

fn record_from_columns(
    alert_id_group: String,
    alert_id_key: String,
    timestamp: &str,
    status: &str,
    message: String,
) -> Result<AlertEventRecord, LogError> {
    let timestamp = parse_db_time(timestamp).map_err(|e| LogError::Corrupt {
        location: format!("{}#{}", alert_id_group, alert_id_key),
        reason: format!("timestamp {:?}: {}", timestamp, e),
    })?;
    Ok(AlertEventRecord {
        alert_id_group,
        alert_id_key,
        timestamp,
        status: status.parse()?,
        message,
    })
}

/// Result log in a table on the query backend
pub struct ClickHouseResultLog {
    backend: Arc<dyn QueryBackend>,
}

impl ClickHouseResultLog {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }

    /// Create the events table if it does not exist yet
    pub async fn ensure_table(&self) -> Result<(), LogError> {
        self.backend.execute(CREATE_TABLE_QUERY, &Params::new()).await?;
        Ok(())
    }
}

impl ResultLog for ClickHouseResultLog {
    fn append<'a>(&'a self, record: &'a AlertEventRecord) -> BoxFuture<'a, Result<(), LogError>> {
        Box::pin(async move {
            let mut params = Params::new();
            params.insert("alert_id_group".to_string(), record.alert_id_group.clone());
            params.insert("alert_id_key".to_string(), record.alert_id_key.clone());
            params.insert("timestamp".to_string(), format_db_time(&record.timestamp));
            params.insert("status".to_string(), record.status.as_str().to_string());
            params.insert("message".to_string(), record.message.clone());

            self.backend.execute(PERSIST_RESULT_QUERY, &params).await?;
            Ok(())
        })
    }

    fn latest_per_alert(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move {
            let rows: Vec<LatestStatusRow> =
                query_rows(self.backend.as_ref(), LOAD_QUERY, &Params::new()).await?;
            rows.into_iter()
                .map(|row| {
                    record_from_columns(
                        row.alert_id_group,
                        row.alert_id_key,
                        &row.latest_timestamp,
                        &row.latest_status,
                        row.latest_message,
                    )
                })
                .collect()
        })
    }

    fn all_records(&self) -> BoxFuture<'_, Result<Vec<AlertEventRecord>, LogError>> {
        Box::pin(async move {
            let rows: Vec<HistoryRow> =
                query_rows(self.backend.as_ref(), HISTORY_QUERY, &Params::new()).await?;
            rows.into_iter()
                .map(|row| {
                    record_from_columns(
                        row.alert_id_group,
                        row.alert_id_key,
                        &row.timestamp,
                        &row.status,
                        row.message,
                    )
                })
                .collect()
        })
    }

    fn truncate(&self) -> BoxFuture<'_, Result<(), LogError>> {
        Box::pin(async move {
            self.backend.execute(TRUNCATE_TABLE_QUERY, &Params::new()).await?;
            Ok(())
        })
    }
}

/// Result log errors
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("Corrupted status: {0}")]
    Status(#[from] UnknownStateError),
}

/// `YYYY-MM-DD HH:MM:SS` timestamps, matching the backend column format
mod db_time_serde {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&crate::clock::format_db_time(time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        crate::clock::parse_db_time(&s).map_err(serde::de::Error::custom)
    }
}
