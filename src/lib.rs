//! Tidewatch: threshold alerting over a time-series query backend
//!
//! Alerts are SQL queries with a threshold and a cron schedule. Tidewatch
//! runs them continuously, keeps one durable row per state change (plus one
//! per alert and day), notifies on those changes and can replay any past time
//! range for backfill.
//!
//! # Features
//!
//! - **Definition files**: YAML alert definitions referencing SQL files
//! - **Write-on-change store**: suppressed duplicates, daily backstop rows
//! - **Failure-aware notification**: a failing notifier is recorded as an error
//! - **Cron scheduling**: one independent task per alert
//! - **Backfill**: one wide query per alert instead of one per tick
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidewatch::alerts::{AlertEvaluator, AlertResultStore, LogNotifier, MemoryResultLog};
//! use tidewatch::alerts::scheduler::AlertScheduler;
//! use tidewatch::backend::clickhouse::{ClickHouseBackend, ClickHouseConfig};
//! use tidewatch::clock::SystemClock;
//! use tidewatch::schedule::CronTicks;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(ClickHouseBackend::new(ClickHouseConfig::default())?);
//! let store = Arc::new(AlertResultStore::new(Arc::new(MemoryResultLog::new())));
//! let evaluator = AlertEvaluator::new(backend, Arc::new(SystemClock));
//!
//! let mut scheduler = AlertScheduler::new(
//!     evaluator,
//!     store,
//!     Arc::new(LogNotifier),
//!     Arc::new(CronTicks::new()),
//! );
//! scheduler.start(Vec::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod backend;
pub mod clock;
pub mod config;
pub mod schedule;

// Re-export commonly used types
pub use alerts::{AlertDefinition, AlertId, AlertResult, AlertState};
pub use backend::{QueryBackend, QueryError};
pub use config::AppConfig;
