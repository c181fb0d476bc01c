//! Re-evaluation of alerts over a past time range
//!
//! Used when a definition is new or changed and its history should be
//! rebuilt. Instead of one query per cron tick it works in three steps:
//!
//! 1. compute every tick between start and end from the cron expression,
//! 2. map each tick to its aggregation bucket with one backend query that
//!    evaluates the `--BUCKET:` expression for all ticks at once,
//! 3. run the alert query once over the whole range and pick, per tick, the
//!    row whose `time_ts` equals the tick's bucket.
//!
//! Each tick is then reduced like a live evaluation, stamped with the tick
//! time and persisted without notifying anybody.
//!
//! Bucket expressions decide what a tick looks at. Monotonic aggregations
//! such as `count()` can watch the current bucket
//! (`toStartOfFifteenMinutes(--NOW--)`); others have to watch the last full
//! one (`toStartOfFifteenMinutes(--NOW-- - INTERVAL 15 MINUTE)`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::definition::{AlertDefinition, AlertId};
use super::evaluator::{evaluate_rows, AlertResultRow};
use super::loader::LoadError;
use super::manager::AlertManager;
use super::notifier::no_notification;
use super::store::{AlertResultStore, StoreError};
use crate::backend::{query_rows, Params, QueryBackend, QueryError};
use crate::schedule::{ScheduleError, TickSource};

#[derive(Debug, Deserialize)]
struct BucketMapping {
    input: i64,
    target_bucket: i64,
}

/// Replays alert evaluation for past cron ticks
pub struct BackfillReconciler {
    backend: Arc<dyn QueryBackend>,
    store: Arc<AlertResultStore>,
    ticks: Arc<dyn TickSource>,
    manager: Option<Arc<AlertManager>>,
}

impl BackfillReconciler {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        store: Arc<AlertResultStore>,
        ticks: Arc<dyn TickSource>,
    ) -> Self {
        Self {
            backend,
            store,
            ticks,
            manager: None,
        }
    }

    /// Source of definitions for `evaluate_alerts`
    pub fn with_manager(mut self, manager: Arc<AlertManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Rediscover all definitions and backfill each of them.
    ///
    /// Stops at the first failing alert.
    pub async fn evaluate_alerts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, BackfillError> {
        let manager = self.manager.as_ref().ok_or(BackfillError::NoManager)?;
        manager.discover().map_err(BackfillError::Discover)?;

        let definitions = manager.definitions();
        tracing::info!(
            alerts = definitions.len(),
            %start,
            %end,
            "Backfilling alerts"
        );

        for definition in &definitions {
            self.evaluate_single_alert(definition, start, end)
                .await
                .map_err(|source| BackfillError::Alert {
                    id: definition.id.clone(),
                    source: Box::new(source),
                })?;
        }
        Ok(definitions.len())
    }

    /// Backfill one definition; returns the number of evaluated ticks
    pub async fn evaluate_single_alert(
        &self,
        definition: &AlertDefinition,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, BackfillError> {
        let ticks = self.execution_times(&definition.check_every, start, end)?;
        tracing::debug!(alert_id = %definition.id, ticks = ?ticks, "times where alert should be evaluated");
        if ticks.is_empty() {
            return Ok(0);
        }

        let buckets = self
            .calculate_buckets(&ticks, &definition.bucket_expression)
            .await?;
        tracing::debug!(alert_id = %definition.id, buckets = ?buckets, "buckets per execution time");

        // the raw query keeps its placeholders as SQL comments, so it returns
        // every bucket instead of only the current one
        let rows: Vec<AlertResultRow> =
            query_rows(self.backend.as_ref(), &definition.query, &definition.params)
                .await
                .map_err(BackfillError::AlertQuery)?;

        for (tick, bucket) in ticks.iter().zip(&buckets) {
            let matched = find_row_for_bucket(&rows, bucket);
            let result = evaluate_rows(definition, matched, *tick);

            self.store
                .persist_and_notify_if_changed(&definition.id, result, no_notification)
                .await?;
        }

        Ok(ticks.len())
    }

    /// Every cron tick in `(start, end]`, in UTC
    pub fn execution_times(
        &self,
        cron: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, BackfillError> {
        let mut times = Vec::new();
        let mut reference = start;

        while reference < end {
            let next = self.ticks.next_tick(cron, reference)?;
            if next > end {
                break;
            }
            times.push(next);
            reference = next;
        }
        Ok(times)
    }

    /// Bucket start for each tick, in tick order
    pub async fn calculate_buckets(
        &self,
        ticks: &[DateTime<Utc>],
        bucket_expression: &str,
    ) -> Result<Vec<DateTime<Utc>>, BackfillError> {
        if ticks.is_empty() {
            return Ok(Vec::new());
        }

        let sql = bucket_conversion_sql(ticks, bucket_expression);
        let mappings: Vec<BucketMapping> = query_rows(self.backend.as_ref(), &sql, &Params::new())
            .await
            .map_err(BackfillError::BucketQuery)?;

        if mappings.len() != ticks.len() {
            return Err(BackfillError::InvariantViolation {
                index: mappings.len().min(ticks.len()),
                reason: format!(
                    "expected {} bucket rows, got {}",
                    ticks.len(),
                    mappings.len()
                ),
            });
        }

        ticks
            .iter()
            .zip(mappings)
            .enumerate()
            .map(|(index, (tick, mapping))| {
                if mapping.input != tick.timestamp() {
                    return Err(BackfillError::InvariantViolation {
                        index,
                        reason: format!(
                            "row input is not the one we expect: expected {}, got {}",
                            tick.timestamp(),
                            mapping.input
                        ),
                    });
                }
                DateTime::<Utc>::from_timestamp(mapping.target_bucket, 0).ok_or_else(|| {
                    BackfillError::InvariantViolation {
                        index,
                        reason: format!("bucket {} out of range", mapping.target_bucket),
                    }
                })
            })
            .collect()
    }
}

/// One query mapping every tick to its bucket; `--NOW--` becomes the tick
fn bucket_conversion_sql(ticks: &[DateTime<Utc>], bucket_expression: &str) -> String {
    let expr = bucket_expression.replace("--NOW--", "input_datetime");
    let inputs = ticks
        .iter()
        .map(|t| t.timestamp().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT input, toDateTime(input, 'UTC') AS input_datetime, \
         toUnixTimestamp({}) AS target_bucket \
         FROM (SELECT arrayJoin([{}]) AS input)",
        expr, inputs
    )
}

fn find_row_for_bucket<'a>(rows: &'a [AlertResultRow], bucket: &DateTime<Utc>) -> &'a [AlertResultRow] {
    rows.iter()
        .position(|row| row.time_ts == bucket.timestamp())
        .map_or(&rows[..0], |i| &rows[i..=i])
}

/// Backfill errors
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("no alert manager configured")]
    NoManager,

    #[error("discovering alert definitions: {0}")]
    Discover(#[source] LoadError),

    #[error("calculating execution times: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("calculating bucket timestamps: {0}")]
    BucketQuery(#[source] QueryError),

    #[error("invariant violation at row {index}: {reason}")]
    InvariantViolation { index: usize, reason: String },

    #[error("running batch alert SQL query: {0}")]
    AlertQuery(#[source] QueryError),

    #[error("persisting alert result: {0}")]
    Store(#[from] StoreError),

    #[error("batch evaluating alert {id}: {source}")]
    Alert {
        id: AlertId,
        #[source]
        source: Box<BackfillError>,
    },
}
