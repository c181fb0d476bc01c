//! Cron tick computation
//!
//! The scheduler and the backfill reconciler only need "next tick after t";
//! `TickSource` keeps them independent of the cron library in use.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use parking_lot::RwLock;

/// Next-tick capability
pub trait TickSource: Send + Sync {
    /// First tick strictly after `after`, in UTC
    fn next_tick(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError>;
}

/// Standard 5-field cron (optional leading seconds field) backed by `croner`
#[derive(Default)]
pub struct CronTicks {
    parsed: RwLock<HashMap<String, Arc<Cron>>>,
}

impl CronTicks {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(&self, expr: &str) -> Result<Arc<Cron>, ScheduleError> {
        if let Some(cron) = self.parsed.read().get(expr) {
            return Ok(Arc::clone(cron));
        }

        let cron = Cron::new(expr)
            .with_seconds_optional()
            .parse()
            .map_err(|e| ScheduleError::InvalidExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        let cron = Arc::new(cron);

        self.parsed
            .write()
            .insert(expr.to_string(), Arc::clone(&cron));
        Ok(cron)
    }
}

impl TickSource for CronTicks {
    fn next_tick(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let cron = self.parse(expr)?;
        cron.find_next_occurrence(&after, false)
            .map_err(|e| ScheduleError::NoNextTick {
                expr: expr.to_string(),
                after,
                reason: e.to_string(),
            })
    }
}

/// Cron errors
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("cron expression {expr:?} has no tick after {after}: {reason}")]
    NoNextTick {
        expr: String,
        after: DateTime<Utc>,
        reason: String,
    },
}
