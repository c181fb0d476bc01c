//! Notification handlers for alert state changes

use futures::future::BoxFuture;

use super::definition::AlertDefinition;
use super::evaluator::{AlertResult, AlertState};

/// Delivers a recorded state change somewhere
pub trait AlertNotifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        definition: &'a AlertDefinition,
        result: &'a AlertResult,
    ) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Notifier used where nobody should be told, e.g. backfill
pub async fn no_notification() -> Result<(), NotifyError> {
    Ok(())
}

/// Logs state changes through tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        definition: &'a AlertDefinition,
        result: &'a AlertResult,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            tracing::warn!(
                alert_id = %definition.id,
                state = %result.state,
                "Alert state changed: {}",
                result.message
            );
            Ok(())
        })
    }
}

/// Posts state changes as a form-encoded webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    id_group: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, id_group: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            id_group: id_group.into(),
        }
    }

    fn form_fields(&self, definition: &AlertDefinition, result: &AlertResult) -> Vec<(&'static str, String)> {
        let state = match result.state {
            AlertState::Ok => "NORMAL",
            AlertState::Warn => "WARNING",
            AlertState::Error => "ERROR",
        };

        let mut fields = vec![
            ("group", format!("tidewatch_{}", self.id_group)),
            ("id", definition.id.to_string()),
            ("state", state.to_string()),
            ("message", result.message.clone()),
        ];
        if let Some(channel) = definition.slack_channel.as_ref().filter(|c| !c.is_empty()) {
            fields.push(("slack_channel", channel.clone()));
        }
        fields
    }
}

impl AlertNotifier for WebhookNotifier {
    fn notify<'a>(
        &'a self,
        definition: &'a AlertDefinition,
        result: &'a AlertResult,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .form(&self.form_fields(definition, result))
                .send()
                .await
                .map_err(|e| NotifyError::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            tracing::debug!(
                alert_id = %definition.id,
                url = %self.url,
                "Webhook notification sent"
            );
            Ok(())
        })
    }
}

/// Notifier errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to send request: {0}")]
    Request(String),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Failed(String),
}
