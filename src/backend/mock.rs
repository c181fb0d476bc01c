//! Scripted in-memory backend for tests

use std::collections::VecDeque;

use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;

use super::{Params, QueryBackend, QueryError, Row};

/// Backend that replays queued responses and records every statement.
///
/// Bucket conversion queries (`... AS target_bucket FROM (SELECT arrayJoin([...]) ...)`)
/// are answered by evaluating `toStartOfHour`, `toStartOfFifteenMinutes` and
/// `toStartOfMinute` with an optional `- INTERVAL n MINUTE`.
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<VecDeque<Result<Vec<Row>, String>>>,
    queries: Mutex<Vec<(String, Params)>>,
    executed: Mutex<Vec<(String, Params)>>,
    fail_execute: Mutex<Option<String>>,
    fail_matching: Mutex<Vec<String>>,
    drop_last_bucket: Mutex<bool>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the rows returned by the next non-bucket query
    pub fn push_rows(&self, rows: Vec<serde_json::Value>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                serde_json::Value::Object(map) => map,
                other => panic!("mock rows must be objects, got {}", other),
            })
            .collect();
        self.responses.lock().push_back(Ok(rows));
    }

    /// Queue a single `{"value": v}` row
    pub fn push_value(&self, value: f64) {
        self.push_rows(vec![json!({ "value": value })]);
    }

    /// Queue a failure for the next non-bucket query
    pub fn push_error(&self, message: &str) {
        self.responses.lock().push_back(Err(message.to_string()));
    }

    /// Make every subsequent `execute` fail
    pub fn fail_execute(&self, message: &str) {
        *self.fail_execute.lock() = Some(message.to_string());
    }

    /// Make every subsequent query containing `pattern` fail
    pub fn fail_matching(&self, pattern: &str) {
        self.fail_matching.lock().push(pattern.to_string());
    }

    /// Answer bucket conversions with one row too few
    pub fn drop_last_bucket(&self) {
        *self.drop_last_bucket.lock() = true;
    }

    pub fn queries(&self) -> Vec<(String, Params)> {
        self.queries.lock().clone()
    }

    pub fn executed(&self) -> Vec<(String, Params)> {
        self.executed.lock().clone()
    }

    fn bucket_rows(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
        let expr_re = Regex::new(r"toUnixTimestamp\((.*)\) AS target_bucket").unwrap();
        let inputs_re = Regex::new(r"arrayJoin\(\[([^\]]*)\]\)").unwrap();
        let bucket_re = Regex::new(
            r"^(toStartOfHour|toStartOfFifteenMinutes|toStartOfMinute)\(input_datetime(?:\s*-\s*INTERVAL\s+(\d+)\s+MINUTE)?\)$",
        )
        .unwrap();

        let expr = expr_re
            .captures(sql)
            .map(|c| c[1].trim().to_string())
            .ok_or_else(|| QueryError::Decode("no target_bucket expression".to_string()))?;
        let caps = bucket_re
            .captures(&expr)
            .ok_or_else(|| QueryError::Backend {
                status: 400,
                body: format!("mock cannot evaluate {}", expr),
            })?;
        let granularity = match &caps[1] {
            "toStartOfHour" => Duration::hours(1),
            "toStartOfFifteenMinutes" => Duration::minutes(15),
            _ => Duration::minutes(1),
        };
        let shift = caps
            .get(2)
            .map(|m| Duration::minutes(m.as_str().parse().unwrap()))
            .unwrap_or_else(Duration::zero);

        let inputs: Vec<i64> = inputs_re
            .captures(sql)
            .map(|c| {
                c[1].split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().parse().unwrap())
                    .collect()
            })
            .unwrap_or_default();

        let mut rows: Vec<Row> = inputs
            .into_iter()
            .map(|input| {
                let time = DateTime::<Utc>::from_timestamp(input, 0).unwrap() - shift;
                let bucket = time.duration_trunc(granularity).unwrap();
                match json!({ "input": input, "target_bucket": bucket.timestamp() }) {
                    serde_json::Value::Object(map) => map,
                    _ => unreachable!(),
                }
            })
            .collect();

        if *self.drop_last_bucket.lock() {
            rows.pop();
        }
        Ok(rows)
    }
}

impl QueryBackend for MockBackend {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>> {
        Box::pin(async move {
            self.queries.lock().push((sql.to_string(), params.clone()));

            if self.fail_matching.lock().iter().any(|p| sql.contains(p.as_str())) {
                return Err(QueryError::Backend {
                    status: 500,
                    body: "scripted failure".to_string(),
                });
            }

            if sql.contains("AS target_bucket") {
                return self.bucket_rows(sql);
            }

            match self.responses.lock().pop_front() {
                Some(Ok(rows)) => Ok(rows),
                Some(Err(body)) => Err(QueryError::Backend { status: 500, body }),
                None => Ok(Vec::new()),
            }
        })
    }

    fn execute<'a>(&'a self, sql: &'a str, params: &'a Params) -> BoxFuture<'a, Result<(), QueryError>> {
        Box::pin(async move {
            if let Some(message) = self.fail_execute.lock().clone() {
                return Err(QueryError::Transport(message));
            }
            self.executed.lock().push((sql.to_string(), params.clone()));
            Ok(())
        })
    }
}
