//! Time source for alert evaluation
//!
//! Evaluation stamps results with the clock's current time and substitutes the
//! clock's SQL literal for `--NOW--` in bucket expressions. Production uses the
//! database's own `now()`; tests pin both to a fixed instant.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// Timestamp format used when talking to the query backend
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current-time capability
pub trait Clock: Send + Sync {
    /// Current instant, used as the timestamp of evaluated results
    fn now(&self) -> DateTime<Utc>;

    /// SQL expression yielding the current instant on the backend
    fn now_sql(&self) -> String;
}

/// Wall clock; lets the backend resolve `now()` itself
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_sql(&self) -> String {
        "now()".to_string()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug)]
pub struct FixedClock {
    time: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: RwLock::new(time),
        }
    }

    /// Parse a `YYYY-MM-DD HH:MM:SS` UTC timestamp
    pub fn at(timestamp: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self::new(parse_db_time(timestamp)?))
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.write() = time;
    }

    pub fn set_str(&self, timestamp: &str) -> Result<(), chrono::ParseError> {
        self.set(parse_db_time(timestamp)?);
        Ok(())
    }

    pub fn advance(&self, by: Duration) {
        let mut time = self.time.write();
        *time += by;
    }

    pub fn increase_by_one_minute(&self) {
        self.advance(Duration::minutes(1));
    }

    pub fn decrease_by_one_minute(&self) {
        self.advance(Duration::minutes(-1));
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.read()
    }

    fn now_sql(&self) -> String {
        format!("toDateTime('{}')", self.now().format(DB_TIME_FORMAT))
    }
}

/// Parse a backend timestamp (`YYYY-MM-DD HH:MM:SS`, always UTC)
pub fn parse_db_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(s, DB_TIME_FORMAT)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Render a timestamp the way the backend expects it
pub fn format_db_time(time: &DateTime<Utc>) -> String {
    time.format(DB_TIME_FORMAT).to_string()
}

/// True when both instants fall on the same UTC calendar day
pub fn same_day(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}
