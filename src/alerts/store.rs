//! Latest alert status with write-on-change persistence
//!
//! Results are only written to the durable log when they mean something:
//!
//! 1) the state changed (OK -> error, error -> warn, ...), or
//! 2) it is the first result of a new UTC day for that alert.
//!
//! Rule 2 keeps history renderable. An alert that never toggles would
//! otherwise have a single row from its first evaluation, and a chart over
//! the last few days could not tell "no data" from "OK the whole time":
//!
//! ```text
//!   --OK-------------------------------> time     without daily rows
//!   --OK-----OK-----OK------OK-----OK--> time     with daily rows
//!                                 ^^^^^ displayed window
//! ```
//!
//! A notification is triggered exactly when a row gets written. A failing
//! notifier turns the row into an error result so the failure shows up in
//! the alert history.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::definition::AlertId;
use super::evaluator::{AlertResult, AlertState};
use super::log::{AlertEventRecord, LogError, ResultLog};
use super::notifier::NotifyError;
use crate::clock::same_day;

/// Cached view of the newest durably stored result of one alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentAlertStatus {
    pub alert_id_group: String,
    pub alert_id_key: String,
    pub latest_timestamp: DateTime<Utc>,
    pub latest_status: AlertState,
    pub latest_message: String,
}

impl CurrentAlertStatus {
    pub fn alert_id(&self) -> AlertId {
        AlertId::new(self.alert_id_group.clone(), self.alert_id_key.clone())
    }
}

impl From<AlertEventRecord> for CurrentAlertStatus {
    fn from(record: AlertEventRecord) -> Self {
        Self {
            alert_id_group: record.alert_id_group,
            alert_id_key: record.alert_id_key,
            latest_timestamp: record.timestamp,
            latest_status: record.status,
            latest_message: record.message,
        }
    }
}

/// What `persist_and_notify_if_changed` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Same state on the same day; nothing written, nobody notified
    Suppressed,
    /// Notifier ran and the result was written
    Recorded,
}

/// Stores alert results and keeps the latest status per alert in memory
pub struct AlertResultStore {
    log: Arc<dyn ResultLog>,
    current: RwLock<HashMap<AlertId, CurrentAlertStatus>>,
}

impl AlertResultStore {
    /// Must be followed by `load_status_into_memory` before use
    pub fn new(log: Arc<dyn ResultLog>) -> Self {
        Self {
            log,
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory status from the durable log
    pub async fn load_status_into_memory(&self) -> Result<(), StoreError> {
        let latest = self.log.latest_per_alert().await.map_err(StoreError::Load)?;

        let indexed: HashMap<AlertId, CurrentAlertStatus> = latest
            .into_iter()
            .map(|record| (record.alert_id(), CurrentAlertStatus::from(record)))
            .collect();

        tracing::debug!(alerts = indexed.len(), "loaded alert status into memory");
        *self.current.write() = indexed;
        Ok(())
    }

    /// Persist `result` and run `notify` if it is a meaningful change.
    ///
    /// The decision is taken under the read lock, which is released before
    /// notifying and writing; only one task drives a given alert id.
    pub async fn persist_and_notify_if_changed<F, Fut>(
        &self,
        id: &AlertId,
        result: AlertResult,
        notify: F,
    ) -> Result<PersistOutcome, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), NotifyError>>,
    {
        let unchanged = {
            let current = self.current.read();
            current.get(id).is_some_and(|status| {
                status.latest_status == result.state
                    && same_day(&status.latest_timestamp, &result.timestamp)
            })
        };
        if unchanged {
            tracing::trace!(alert_id = %id, state = %result.state, "alert state unchanged");
            return Ok(PersistOutcome::Suppressed);
        }

        let result = match notify().await {
            Ok(()) => result,
            Err(e) => {
                tracing::warn!(alert_id = %id, error = %e, "notifier failed, recording error state");
                AlertResult::new(
                    AlertState::Error,
                    format!("Error triggering notifier: {}", e),
                    result.timestamp,
                )
            }
        };

        // the log keeps whole seconds; cache what a reload would see
        let record = AlertEventRecord {
            alert_id_group: id.group.clone(),
            alert_id_key: id.key.clone(),
            timestamp: result.timestamp.trunc_subsecs(0),
            status: result.state,
            message: result.message,
        };

        self.log
            .append(&record)
            .await
            .map_err(|source| StoreError::Persist {
                id: id.clone(),
                source,
            })?;

        tracing::debug!(
            alert_id = %id,
            state = %record.status,
            timestamp = %record.timestamp,
            "persisted alert result"
        );

        let mut current = self.current.write();
        match current.get_mut(id) {
            Some(status) => {
                status.latest_timestamp = record.timestamp;
                status.latest_status = record.status;
                status.latest_message = record.message;
            }
            None => {
                current.insert(id.clone(), CurrentAlertStatus::from(record));
            }
        }

        Ok(PersistOutcome::Recorded)
    }

    /// Truncate the durable log and forget every cached status
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.log.truncate().await.map_err(StoreError::Clear)?;
        self.current.write().clear();
        Ok(())
    }

    pub fn current_status(&self, id: &AlertId) -> Option<CurrentAlertStatus> {
        self.current.read().get(id).cloned()
    }

    /// Every cached status, ordered by alert id
    pub fn snapshot(&self) -> Vec<CurrentAlertStatus> {
        let mut statuses: Vec<_> = self.current.read().values().cloned().collect();
        statuses.sort_by_key(|s| s.alert_id());
        statuses
    }
}

/// Result store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("loading alert events into memory: {0}")]
    Load(#[source] LogError),

    #[error("persisting {id}: {source}")]
    Persist {
        id: AlertId,
        #[source]
        source: LogError,
    },

    #[error("truncating alert events: {0}")]
    Clear(#[source] LogError),
}
