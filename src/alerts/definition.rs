//! Alert definition types

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifies an alert definition uniquely
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertId {
    /// Path of the definition file the alert lives in
    pub group: String,
    /// Entry name inside that file
    pub key: String,
}

impl AlertId {
    pub fn new(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.group, self.key)
    }
}

impl FromStr for AlertId {
    type Err = AlertIdError;

    /// Splits on the first `#`; the key may itself contain `#`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, key) = s
            .split_once('#')
            .ok_or_else(|| AlertIdError(s.to_string()))?;
        Ok(Self::new(group, key))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid alert id {0:?}, expected <group>#<key>")]
pub struct AlertIdError(pub String);

/// One configured check: query + condition + schedule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDefinition {
    #[serde(skip)]
    pub id: AlertId,
    /// Query file, relative to the definition file while parsing and
    /// normalized to the content root afterwards
    #[serde(default)]
    pub query_path: String,
    /// Full SQL text of the query file
    #[serde(skip)]
    pub query: String,
    /// Part after `--BUCKET:` in the query file header
    #[serde(skip)]
    pub bucket_expression: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub alert_if: AlertCondition,
    #[serde(default)]
    pub message: String,
    /// Cron expression the query is re-executed at
    #[serde(default)]
    pub check_every: String,
    /// Channel passed on to the notifier
    #[serde(default)]
    pub slack_channel: Option<String>,
}

impl AlertDefinition {
    /// Create a definition checked every minute
    pub fn new(id: AlertId, query: impl Into<String>, alert_if: AlertCondition) -> Self {
        Self {
            id,
            query: query.into(),
            alert_if,
            check_every: "* * * * *".to_string(),
            ..Default::default()
        }
    }

    pub fn with_bucket_expression(mut self, expr: impl Into<String>) -> Self {
        self.bucket_expression = expr.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_check_every(mut self, cron: impl Into<String>) -> Self {
        self.check_every = cron.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// When an alert fires. Exactly one bound is expected to be set.
///
/// Zero result rows count as value 0, one row is compared, more than one
/// row is an error regardless of the bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_lt: Option<f64>,
}

impl AlertCondition {
    pub fn greater_than(threshold: f64) -> Self {
        Self {
            value_gt: Some(threshold),
            value_lt: None,
        }
    }

    pub fn less_than(threshold: f64) -> Self {
        Self {
            value_gt: None,
            value_lt: Some(threshold),
        }
    }

    /// The single bound this condition compares against
    pub fn threshold(&self) -> Result<Threshold, ConditionError> {
        match (self.value_gt, self.value_lt) {
            (Some(t), None) => Ok(Threshold::GreaterThan(t)),
            (None, Some(t)) => Ok(Threshold::LessThan(t)),
            (None, None) => Err(ConditionError::Missing),
            (Some(_), Some(_)) => Err(ConditionError::Ambiguous),
        }
    }
}

/// Resolved comparison of an alert condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    GreaterThan(f64),
    LessThan(f64),
}

impl Threshold {
    /// Whether `value` is on the alerting side of the bound
    pub fn breached_by(&self, value: f64) -> bool {
        match *self {
            Threshold::GreaterThan(t) => value > t,
            Threshold::LessThan(t) => value < t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("no alert_if condition found")]
    Missing,

    #[error("both value_gt and value_lt set, but only one allowed")]
    Ambiguous,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_id_round_trip() {
        let id: AlertId = "group1#alert1".parse().unwrap();
        assert_eq!(id.group, "group1");
        assert_eq!(id.key, "alert1");
        assert_eq!(id.to_string(), "group1#alert1");
    }

    #[test]
    fn test_alert_id_splits_on_first_hash() {
        let id: AlertId = "content/a/alerts.yaml#key#with#hashes".parse().unwrap();
        assert_eq!(id.group, "content/a/alerts.yaml");
        assert_eq!(id.key, "key#with#hashes");
    }

    #[test]
    fn test_alert_id_without_separator() {
        assert!("no-separator".parse::<AlertId>().is_err());
    }

    #[test]
    fn test_condition_threshold() {
        assert_eq!(
            AlertCondition::greater_than(10.0).threshold(),
            Ok(Threshold::GreaterThan(10.0))
        );
        assert_eq!(
            AlertCondition::less_than(2.0).threshold(),
            Ok(Threshold::LessThan(2.0))
        );
        assert_eq!(
            AlertCondition::default().threshold(),
            Err(ConditionError::Missing)
        );

        let both = AlertCondition {
            value_gt: Some(1.0),
            value_lt: Some(2.0),
        };
        assert_eq!(both.threshold(), Err(ConditionError::Ambiguous));
    }

    #[test]
    fn test_threshold_boundaries() {
        let gt = Threshold::GreaterThan(10.0);
        assert!(gt.breached_by(10.5));
        assert!(!gt.breached_by(10.0));

        let lt = Threshold::LessThan(10.0);
        assert!(lt.breached_by(9.99));
        assert!(!lt.breached_by(10.0));
    }

    #[test]
    fn test_definition_builder() {
        let def = AlertDefinition::new(
            AlertId::new("g", "k"),
            "SELECT 1 AS value",
            AlertCondition::greater_than(0.0),
        )
        .with_bucket_expression("toStartOfHour(--NOW--)")
        .with_message("too high")
        .with_check_every("*/5 * * * *")
        .with_param("limit", "10");

        assert_eq!(def.id.to_string(), "g#k");
        assert_eq!(def.check_every, "*/5 * * * *");
        assert_eq!(def.params["limit"], "10");
        assert_eq!(def.message, "too high");
    }
}
