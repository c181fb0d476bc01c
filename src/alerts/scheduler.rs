//! Recurring alert checks
//!
//! Every definition gets its own task driven by its cron expression. Before
//! any task starts, all alerts are checked once; a failure there aborts the
//! start. Once running, a failing check only affects its own alert.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::definition::{AlertDefinition, AlertId};
use super::evaluator::{AlertEvaluator, EvaluateError};
use super::notifier::AlertNotifier;
use super::store::{AlertResultStore, PersistOutcome, StoreError};
use crate::schedule::{ScheduleError, TickSource};

/// Everything one alert check needs
#[derive(Clone)]
struct CheckContext {
    evaluator: AlertEvaluator,
    store: Arc<AlertResultStore>,
    notifier: Arc<dyn AlertNotifier>,
}

impl CheckContext {
    /// Evaluate once and persist/notify if the result is a change
    async fn check(&self, definition: &AlertDefinition) -> Result<PersistOutcome, CheckError> {
        let result = self.evaluator.evaluate(definition).await?;
        let notified = result.clone();

        let outcome = self
            .store
            .persist_and_notify_if_changed(&definition.id, result, || {
                self.notifier.notify(definition, &notified)
            })
            .await?;
        Ok(outcome)
    }
}

/// Runs one recurring check per alert definition
pub struct AlertScheduler {
    context: CheckContext,
    ticks: Arc<dyn TickSource>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl AlertScheduler {
    pub fn new(
        evaluator: AlertEvaluator,
        store: Arc<AlertResultStore>,
        notifier: Arc<dyn AlertNotifier>,
        ticks: Arc<dyn TickSource>,
    ) -> Self {
        Self {
            context: CheckContext {
                evaluator,
                store,
                notifier,
            },
            ticks,
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    /// Load the stored status, check every alert once, then start the
    /// recurring tasks. Returns the number of started tasks.
    pub async fn start(&mut self, definitions: Vec<AlertDefinition>) -> Result<usize, SchedulerError> {
        self.context
            .store
            .load_status_into_memory()
            .await
            .map_err(SchedulerError::Load)?;

        if definitions.is_empty() {
            tracing::info!("No alert definitions, scheduler idle");
            return Ok(0);
        }

        for definition in &definitions {
            self.ticks
                .next_tick(&definition.check_every, Utc::now())
                .map_err(|source| SchedulerError::Schedule {
                    id: definition.id.clone(),
                    source,
                })?;

            self.context
                .check(definition)
                .await
                .map_err(|source| SchedulerError::Startup {
                    id: definition.id.clone(),
                    source,
                })?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        for definition in definitions {
            let context = self.context.clone();
            let ticks = Arc::clone(&self.ticks);
            let shutdown_rx = shutdown_rx.clone();
            self.handles.push(tokio::spawn(run_alert_task(
                context,
                ticks,
                definition,
                shutdown_rx,
            )));
        }

        tracing::info!(alerts = self.handles.len(), "Alert scheduler started");
        Ok(self.handles.len())
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop all tasks; a check already in progress runs to completion
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Alert task panicked");
            }
        }
        tracing::info!("Alert scheduler stopped");
    }
}

async fn run_alert_task(
    context: CheckContext,
    ticks: Arc<dyn TickSource>,
    definition: AlertDefinition,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let now = Utc::now();
        let next = match ticks.next_tick(&definition.check_every, now) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(alert_id = %definition.id, error = %e, "Alert task has no next tick");
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => return,
        }

        match context.check(&definition).await {
            Ok(outcome) => {
                tracing::trace!(alert_id = %definition.id, ?outcome, "Alert checked");
            }
            Err(e) => {
                tracing::error!(alert_id = %definition.id, error = %e, "Alert check failed");
            }
        }
    }
}

/// Failure of a single alert check
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("evaluating alert: {0}")]
    Evaluate(#[from] EvaluateError),

    #[error("persisting alert result: {0}")]
    Store(#[from] StoreError),
}

/// Scheduler start errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("loading alert status into memory: {0}")]
    Load(#[source] StoreError),

    #[error("alert {id}: {source}")]
    Schedule {
        id: AlertId,
        #[source]
        source: ScheduleError,
    },

    #[error("startup check of alert {id}: {source}")]
    Startup {
        id: AlertId,
        #[source]
        source: CheckError,
    },
}
