//! Threshold evaluation of a single alert

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{AlertDefinition, AlertId};
use crate::backend::{query_rows, QueryBackend, QueryError};
use crate::clock::Clock;

/// Outcome of an alert check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertState {
    #[serde(rename = "OK")]
    Ok,
    /// Never produced by threshold evaluation, but stored and compared like
    /// the others
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl AlertState {
    pub const ALL: [AlertState; 3] = [AlertState::Error, AlertState::Warn, AlertState::Ok];

    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Ok => "OK",
            AlertState::Warn => "warn",
            AlertState::Error => "error",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("alert state '{0}' found, but only [error warn OK] supported")]
pub struct UnknownStateError(pub String);

/// Result of one evaluation; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResult {
    pub state: AlertState,
    pub message: String,
    /// Evaluation time, not a time taken from the query result
    pub timestamp: DateTime<Utc>,
}

impl AlertResult {
    pub fn new(state: AlertState, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            state,
            message: message.into(),
            timestamp,
        }
    }
}

/// Row shape alert queries must return
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AlertResultRow {
    /// Bucket start as unix seconds; only needed for backfill
    #[serde(default)]
    pub time_ts: i64,
    pub value: f64,
}

/// Runs alert queries and reduces their result to an `AlertResult`
#[derive(Clone)]
pub struct AlertEvaluator {
    backend: Arc<dyn QueryBackend>,
    clock: Arc<dyn Clock>,
}

impl AlertEvaluator {
    pub fn new(backend: Arc<dyn QueryBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Same backend, different time source
    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            clock,
        }
    }

    /// Run the alert query once and reduce it to a result.
    ///
    /// Backend failures are returned as errors, not as an error state.
    pub async fn evaluate(&self, definition: &AlertDefinition) -> Result<AlertResult, EvaluateError> {
        let sql = preprocess_sql(definition, self.clock.as_ref());
        let rows: Vec<AlertResultRow> = query_rows(self.backend.as_ref(), &sql, &definition.params)
            .await
            .map_err(|source| EvaluateError::Query {
                id: definition.id.clone(),
                source,
            })?;

        tracing::debug!(
            alert_id = %definition.id,
            sql_path = %definition.query_path,
            current_time = %self.clock.now_sql(),
            results = ?rows,
            "received result set"
        );

        Ok(self.evaluate_threshold(definition, &rows))
    }

    /// Reduce rows to a result stamped with the clock's current time
    pub fn evaluate_threshold(&self, definition: &AlertDefinition, rows: &[AlertResultRow]) -> AlertResult {
        evaluate_rows(definition, rows, self.clock.now())
    }
}

/// Reduce zero or one result rows to a state.
///
/// Zero rows count as value 0. More than one row is a query error whatever
/// the condition says.
pub fn evaluate_rows(
    definition: &AlertDefinition,
    rows: &[AlertResultRow],
    timestamp: DateTime<Utc>,
) -> AlertResult {
    let value = match rows {
        [] => 0.0,
        [row] => row.value,
        _ => {
            return AlertResult::new(
                AlertState::Error,
                format!(
                    "QUERY ERROR: found {} result rows, but only 0 or 1 allowed",
                    rows.len()
                ),
                timestamp,
            )
        }
    };

    match definition.alert_if.threshold() {
        Ok(threshold) if threshold.breached_by(value) => {
            AlertResult::new(AlertState::Error, definition.message.clone(), timestamp)
        }
        Ok(_) => AlertResult::new(AlertState::Ok, "", timestamp),
        Err(e) => AlertResult::new(AlertState::Error, format!("INTERNAL ERROR: {}.", e), timestamp),
    }
}

/// Resolve the textual placeholders of an alert query.
///
/// `--HAVING--` becomes `HAVING`, `--BUCKET--` the bucket expression, and
/// `--NOW--` inside the bucket expression the clock's SQL literal.
pub fn preprocess_sql(definition: &AlertDefinition, clock: &dyn Clock) -> String {
    let bucket = definition
        .bucket_expression
        .replace("--NOW--", &clock.now_sql());

    definition
        .query
        .replace("--HAVING--", "HAVING")
        .replace("--BUCKET--", &bucket)
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    #[error("running alert SQL query for {id}: {source}")]
    Query {
        id: AlertId,
        #[source]
        source: QueryError,
    },
}
