//! Task definitions: triggers, handlers and outcomes.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

/// Error a task handler reports for one failed run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Body of a task. Receives the dispatch arguments (`null` for runs fired by
/// the schedule).
pub type TaskHandler = Arc<dyn Fn(&Value) -> Result<Value, TaskError> + Send + Sync + 'static>;

/// One field of a [`CronSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CronField {
    #[default]
    Any,
    At(u32),
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::At(n) => n == value,
        }
    }

    fn in_range(self, lo: u32, hi: u32) -> bool {
        match self {
            Self::Any => true,
            Self::At(n) => (lo..=hi).contains(&n),
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::At(n) => write!(f, "{n}"),
        }
    }
}

/// Calendar constraints, matched in UTC. Unset fields are wildcards.
///
/// Day of week counts from Sunday = 0.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use tally::background::CronSpec;
///
/// // Every Monday at 09:00.
/// let spec = CronSpec::new().day_of_week(1).hour(9).minute(0);
/// assert!(spec.matches(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()));
/// assert!(!spec.matches(Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CronSpec {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_week: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
}

impl CronSpec {
    /// A spec that matches every minute.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn minute(mut self, minute: u32) -> Self {
        self.minute = CronField::At(minute);
        self
    }

    #[must_use]
    pub fn hour(mut self, hour: u32) -> Self {
        self.hour = CronField::At(hour);
        self
    }

    #[must_use]
    pub fn day_of_week(mut self, day: u32) -> Self {
        self.day_of_week = CronField::At(day);
        self
    }

    #[must_use]
    pub fn day_of_month(mut self, day: u32) -> Self {
        self.day_of_month = CronField::At(day);
        self
    }

    #[must_use]
    pub fn month(mut self, month: u32) -> Self {
        self.month = CronField::At(month);
        self
    }

    /// `true` when every constrained field matches `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
    }

    /// `true` when every literal is within its calendar range.
    pub fn is_valid(&self) -> bool {
        self.minute.in_range(0, 59)
            && self.hour.in_range(0, 23)
            && self.day_of_week.in_range(0, 6)
            && self.day_of_month.in_range(1, 31)
            && self.month.in_range(1, 12)
    }
}

impl fmt::Display for CronSpec {
    /// Classic five-field order: minute hour day-of-month month day-of-week.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

/// When a task becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every `Duration`, measured from registration and then from each firing.
    Interval(Duration),
    /// Whenever the wall clock matches, at most once per minute.
    Cron(CronSpec),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(every) => write!(f, "every {}s", every.as_secs_f64()),
            Self::Cron(spec) => write!(f, "cron({spec})"),
        }
    }
}

/// Result of one task run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed { error: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The record handed back to callers: the handler's own value on
    /// success, `{"success": false, "error": "..."}` on failure.
    pub fn into_record(self) -> Value {
        match self {
            Self::Succeeded(value) => value,
            Self::Failed { error } => json!({ "success": false, "error": error }),
        }
    }
}

/// A named unit of periodic work.
///
/// Built once at startup and never mutated.
#[derive(Clone)]
pub struct ScheduledTask {
    name: String,
    trigger: Trigger,
    handler: TaskHandler,
}

impl ScheduledTask {
    pub fn new<F>(name: impl Into<String>, trigger: Trigger, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            trigger,
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Runs the handler on the calling thread.
    ///
    /// Errors and panics are logged and folded into
    /// [`TaskOutcome::Failed`]; nothing escapes to the caller.
    pub fn run(&self, args: &Value) -> TaskOutcome {
        match catch_unwind(AssertUnwindSafe(|| (self.handler)(args))) {
            Ok(Ok(value)) => TaskOutcome::Succeeded(value),
            Ok(Err(e)) => {
                error!(task = %self.name, error = %e, "task failed");
                TaskOutcome::Failed { error: e.0 }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task = %self.name, error = %message, "task panicked");
                TaskOutcome::Failed { error: message }
            }
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn daily_spec_matches_only_its_minute() {
        let spec = CronSpec::new().hour(0).minute(5);
        assert!(spec.matches(at(2024, 1, 2, 0, 5, 0)));
        assert!(spec.matches(at(2024, 1, 2, 0, 5, 59)));
        assert!(!spec.matches(at(2024, 1, 2, 0, 4, 59)));
        assert!(!spec.matches(at(2024, 1, 2, 1, 5, 0)));
    }

    #[test]
    fn weekday_counts_from_sunday() {
        let monday_nine = CronSpec::new().day_of_week(1).hour(9).minute(0);
        // 2024-01-07 is a Sunday, 2024-01-08 a Monday.
        assert!(!monday_nine.matches(at(2024, 1, 7, 9, 0, 0)));
        assert!(monday_nine.matches(at(2024, 1, 8, 9, 0, 0)));
        assert!(CronSpec::new().day_of_week(0).matches(at(2024, 1, 7, 12, 0, 0)));
    }

    #[test]
    fn day_of_month_and_month() {
        let new_year = CronSpec::new().month(1).day_of_month(1).hour(0).minute(0);
        assert!(new_year.matches(at(2025, 1, 1, 0, 0, 0)));
        assert!(!new_year.matches(at(2025, 2, 1, 0, 0, 0)));
    }

    #[test]
    fn range_validation() {
        assert!(CronSpec::new().is_valid());
        assert!(CronSpec::new().hour(23).minute(59).day_of_week(6).is_valid());
        assert!(!CronSpec::new().minute(60).is_valid());
        assert!(!CronSpec::new().day_of_week(7).is_valid());
        assert!(!CronSpec::new().day_of_month(0).is_valid());
        assert!(!CronSpec::new().month(13).is_valid());
    }

    #[test]
    fn display_uses_five_field_order() {
        let spec = CronSpec::new().day_of_week(1).hour(9).minute(0);
        assert_eq!(spec.to_string(), "0 9 * * 1");
        assert_eq!(Trigger::Interval(Duration::from_secs(3600)).to_string(), "every 3600s");
    }

    #[test]
    fn run_converts_errors_into_failure_records() {
        let task = ScheduledTask::new("boom", Trigger::Interval(Duration::from_secs(1)), |_| {
            Err(TaskError::new("database unavailable"))
        });
        for _ in 0..2 {
            let outcome = task.run(&Value::Null);
            assert!(!outcome.is_success());
            assert_eq!(
                outcome.into_record(),
                json!({"success": false, "error": "database unavailable"})
            );
        }
    }

    #[test]
    fn run_contains_panics() {
        let task = ScheduledTask::new("panics", Trigger::Interval(Duration::from_secs(1)), |_| {
            panic!("index out of bounds")
        });
        assert_eq!(
            task.run(&Value::Null),
            TaskOutcome::Failed {
                error: "index out of bounds".to_owned()
            }
        );
    }

    #[test]
    fn run_passes_arguments_and_returns_value() {
        let task = ScheduledTask::new("echo", Trigger::Interval(Duration::from_secs(1)), |args| {
            Ok(json!({ "got": args.clone() }))
        });
        assert_eq!(
            task.run(&json!([1, 2])).into_record(),
            json!({ "got": [1, 2] })
        );
    }
}
