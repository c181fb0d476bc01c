//! ClickHouse HTTP transport

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use super::{Params, QueryBackend, QueryError, Row};

/// Connection settings for one ClickHouse server
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://127.0.0.1:8123`
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            user: None,
            password: None,
            database: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// `FORMAT JSON` response envelope
#[derive(Debug, Deserialize)]
struct JsonResult {
    data: Vec<Row>,
}

/// Query backend speaking the ClickHouse HTTP protocol
#[derive(Debug, Clone)]
pub struct ClickHouseBackend {
    http_client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseBackend {
    pub fn new(config: ClickHouseConfig) -> Result<Self, QueryError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| QueryError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// URL parameters shared by reads and writes
    fn url_params(&self, params: &Params) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(params.len() + 5);

        if let Some(database) = &self.config.database {
            pairs.push(("database".to_string(), database.clone()));
        }
        pairs.push(("default_format".to_string(), "JSON".to_string()));
        // numbers must arrive as JSON numbers, not quoted strings
        for setting in [
            "output_format_json_quote_decimals",
            "output_format_json_quote_64bit_integers",
            "output_format_json_quote_64bit_floats",
        ] {
            pairs.push((setting.to_string(), "0".to_string()));
        }
        for (name, value) in params {
            pairs.push((format!("param_{}", name), value.clone()));
        }

        pairs
    }

    fn request(&self, method: reqwest::Method, params: &Params) -> reqwest::RequestBuilder {
        let mut request = self
            .http_client
            .request(method, &self.config.url)
            .query(&self.url_params(params))
            .header(reqwest::header::CONTENT_TYPE, "text/plain");

        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.password.as_ref());
        }

        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, sql: &str) -> Result<reqwest::Response, QueryError> {
        tracing::debug!(query = %sql, "executing SQL query");

        let response = request
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

impl QueryBackend for ClickHouseBackend {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Row>, QueryError>> {
        Box::pin(async move {
            // GET keeps the server in readonly mode for alert queries
            let request = self
                .request(reqwest::Method::GET, params)
                .query(&[("query", sql)]);
            let response = self.send(request, sql).await?;

            let result: JsonResult = response
                .json()
                .await
                .map_err(|e| QueryError::Decode(e.to_string()))?;
            Ok(result.data)
        })
    }

    fn execute<'a>(&'a self, sql: &'a str, params: &'a Params) -> BoxFuture<'a, Result<(), QueryError>> {
        Box::pin(async move {
            let request = self
                .request(reqwest::Method::POST, params)
                .body(sql.to_string());
            self.send(request, sql).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_params_prefix_named_parameters() {
        let backend = ClickHouseBackend::new(ClickHouseConfig {
            database: Some("alerts".to_string()),
            ..Default::default()
        })
        .unwrap();

        let mut params = Params::new();
        params.insert("threshold".to_string(), "90".to_string());

        let pairs = backend.url_params(&params);
        assert!(pairs.contains(&("database".to_string(), "alerts".to_string())));
        assert!(pairs.contains(&("default_format".to_string(), "JSON".to_string())));
        assert!(pairs.contains(&("param_threshold".to_string(), "90".to_string())));
    }

    #[test]
    fn test_json_envelope_ignores_meta() {
        let body = r#"{"meta":[{"name":"value","type":"Float64"}],"data":[{"value":4}],"rows":1}"#;
        let result: JsonResult = serde_json::from_str(body).unwrap();
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0]["value"], serde_json::json!(4));
    }
}
