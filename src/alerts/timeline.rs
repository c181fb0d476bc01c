//! Alert history as contiguous status spans

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::definition::AlertId;
use super::evaluator::AlertState;
use super::log::AlertEventRecord;

/// Time an alert spent in one recorded state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSpan {
    pub alert_id: AlertId,
    pub status: AlertState,
    pub message: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl StatusSpan {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// One span per record, ending where the alert's next record starts.
///
/// The newest span of each alert stays open until `now`.
pub fn status_spans(mut records: Vec<AlertEventRecord>, now: DateTime<Utc>) -> Vec<StatusSpan> {
    records.sort_by(|a, b| {
        (&a.alert_id_group, &a.alert_id_key, a.timestamp)
            .cmp(&(&b.alert_id_group, &b.alert_id_key, b.timestamp))
    });

    let mut spans: Vec<StatusSpan> = Vec::with_capacity(records.len());
    for record in records {
        let alert_id = record.alert_id();
        if let Some(previous) = spans.last_mut().filter(|s| s.alert_id == alert_id) {
            previous.end = record.timestamp;
        }
        spans.push(StatusSpan {
            end: now.max(record.timestamp),
            alert_id,
            status: record.status,
            message: record.message,
            start: record.timestamp,
        });
    }
    spans
}
