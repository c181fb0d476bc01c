//! Query backend seam
//!
//! Alert queries, bucket conversions and the durable result log all go through
//! `QueryBackend`: SQL text plus named string parameters in, JSON rows out.

pub mod clickhouse;

#[cfg(test)]
pub(crate) mod mock;

pub use clickhouse::{ClickHouseBackend, ClickHouseConfig};

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

/// Named query parameters
pub type Params = HashMap<String, String>;

/// One result row, column name to value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// SQL execution capability
pub trait QueryBackend: Send + Sync {
    /// Run a read-only query and return its rows
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>>;

    /// Run a statement that writes (INSERT, TRUNCATE, ...)
    fn execute<'a>(&'a self, sql: &'a str, params: &'a Params) -> BoxFuture<'a, Result<(), QueryError>>;
}

/// Run a query and deserialize every row into `T`
pub async fn query_rows<T: DeserializeOwned>(
    backend: &dyn QueryBackend,
    sql: &str,
    params: &Params,
) -> Result<Vec<T>, QueryError> {
    let rows = backend.query(sql, params).await?;
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(serde_json::Value::Object(row))
                .map_err(|e| QueryError::Decode(e.to_string()))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),
}
