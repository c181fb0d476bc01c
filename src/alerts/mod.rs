//! Threshold alerting
//!
//! Definitions are loaded from YAML files next to their SQL queries. The
//! scheduler evaluates them continuously, the backfill reconciler replays
//! them over a past range. Every result goes through the result store, which
//! only writes and notifies on meaningful changes.

pub mod backfill;
pub mod definition;
pub mod evaluator;
pub mod loader;
pub mod log;
pub mod manager;
pub mod notifier;
pub mod scheduler;
pub mod store;
pub mod timeline;

pub use backfill::{BackfillError, BackfillReconciler};
pub use definition::{AlertCondition, AlertDefinition, AlertId, Threshold};
pub use evaluator::{AlertEvaluator, AlertResult, AlertState, EvaluateError};
pub use loader::{DefinitionFs, DirFs, LoadError, MemoryFs};
pub use log::{AlertEventRecord, ClickHouseResultLog, FileResultLog, LogError, MemoryResultLog, ResultLog};
pub use manager::AlertManager;
pub use notifier::{AlertNotifier, LogNotifier, NotifyError, WebhookNotifier};
pub use scheduler::{AlertScheduler, SchedulerError};
pub use store::{AlertResultStore, CurrentAlertStatus, PersistOutcome, StoreError};
pub use timeline::{status_spans, StatusSpan};
