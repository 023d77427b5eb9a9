//! The task scheduler: registration, due-time evaluation and dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::dispatch::{Dispatcher, ExecutionMode, Handle, TaskQueue, select_dispatcher};
use super::registry::{TaskRegistry, TaskState};
use super::task::{ScheduledTask, Trigger};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),

    #[error("no task named `{0}`")]
    UnknownTask(String),

    #[error("task `{task}` has an invalid trigger: {reason}")]
    InvalidTrigger { task: String, reason: String },

    #[error("task `{0}` is already running")]
    AlreadyRunning(String),
}

struct ScheduleEntry {
    trigger: Trigger,
    last_fired: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.trigger {
            Trigger::Interval(every) => match self.last_fired {
                Some(last) => (now - last).to_std().is_ok_and(|elapsed| elapsed >= every),
                None => true,
            },
            Trigger::Cron(spec) => {
                spec.matches(now)
                    && self
                        .last_fired
                        .is_none_or(|last| minute_of(last) != minute_of(now))
            }
        }
    }
}

fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Decides when registered tasks run and hands them to the dispatcher
/// chosen at construction.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use tally::background::{ExecutionMode, ScheduledTask, TaskScheduler, Trigger};
///
/// let scheduler = TaskScheduler::new(None);
/// assert_eq!(scheduler.mode(), ExecutionMode::Synchronous);
///
/// scheduler
///     .register(ScheduledTask::new(
///         "ping",
///         Trigger::Interval(Duration::from_secs(60)),
///         |_| Ok(json!("pong")),
///     ))
///     .unwrap();
///
/// let handle = scheduler.dispatch("ping", json!(null)).unwrap();
/// assert!(handle.outcome().unwrap().is_success());
/// ```
pub struct TaskScheduler {
    registry: Arc<TaskRegistry>,
    dispatcher: Box<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    schedule: Mutex<HashMap<String, ScheduleEntry>>,
}

impl TaskScheduler {
    /// A scheduler with its own registry, in the mode `queue` allows.
    pub fn new(queue: Option<Arc<dyn TaskQueue>>) -> Self {
        Self::with_registry(Arc::new(TaskRegistry::new()), queue)
    }

    /// A scheduler over a shared registry, for when workers draining `queue`
    /// execute out of the same registry.
    pub fn with_registry(registry: Arc<TaskRegistry>, queue: Option<Arc<dyn TaskQueue>>) -> Self {
        let dispatcher = select_dispatcher(queue);
        Self {
            registry,
            dispatcher,
            clock: Arc::new(SystemClock),
            schedule: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.dispatcher.mode()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.registry.state(name)
    }

    /// Adds `task` to the schedule.
    ///
    /// Interval tasks count their first period from now; cron tasks fire the
    /// next time the clock matches.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DuplicateTask`] if the name is taken,
    /// [`SchedulerError::InvalidTrigger`] for a zero interval or an
    /// out-of-range cron field.
    pub fn register(&self, task: ScheduledTask) -> Result<(), SchedulerError> {
        let trigger = *task.trigger();
        match trigger {
            Trigger::Interval(every) if every.is_zero() => {
                return Err(SchedulerError::InvalidTrigger {
                    task: task.name().to_owned(),
                    reason: "interval must be greater than zero".into(),
                });
            }
            Trigger::Cron(spec) if !spec.is_valid() => {
                return Err(SchedulerError::InvalidTrigger {
                    task: task.name().to_owned(),
                    reason: format!("cron field out of range in `{spec}`"),
                });
            }
            _ => {}
        }

        let name = task.name().to_owned();
        self.registry.insert(task)?;
        let last_fired = match trigger {
            Trigger::Interval(_) => Some(self.clock.now()),
            Trigger::Cron(_) => None,
        };
        self.schedule().insert(
            name.clone(),
            ScheduleEntry {
                trigger,
                last_fired,
            },
        );
        info!(task = %name, %trigger, "task registered");
        Ok(())
    }

    /// Dispatches every task due at `now`, in name order.
    ///
    /// A task counts as fired as soon as it is found due, whether its run
    /// then succeeds, fails, or is skipped because the previous run is still
    /// going.
    pub fn run_due_tasks(&self, now: DateTime<Utc>) -> Vec<Handle> {
        let mut due: Vec<String> = {
            let mut schedule = self.schedule();
            schedule
                .iter_mut()
                .filter(|(_, entry)| entry.is_due(now))
                .map(|(name, entry)| {
                    entry.last_fired = Some(now);
                    name.clone()
                })
                .collect()
        };
        due.sort();
        if !due.is_empty() {
            debug!(count = due.len(), "tasks due");
        }

        let mut handles = Vec::with_capacity(due.len());
        for name in due {
            match self.dispatcher.dispatch(&self.registry, &name, Value::Null) {
                Ok(handle) => handles.push(handle),
                Err(SchedulerError::AlreadyRunning(_)) => {
                    warn!(task = %name, "previous run still in progress, skipping");
                }
                Err(e) => error!(task = %name, error = %e, "dispatch failed"),
            }
        }
        handles
    }

    /// Runs `name` now, outside its schedule, through the configured
    /// dispatcher.
    pub fn dispatch(&self, name: &str, args: Value) -> Result<Handle, SchedulerError> {
        if self.registry.get(name).is_none() {
            return Err(SchedulerError::UnknownTask(name.to_owned()));
        }
        self.dispatcher.dispatch(&self.registry, name, args)
    }

    fn schedule(&self) -> MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::dispatch::{QueueError, TaskId};
    use crate::background::task::{CronSpec, TaskError, TaskOutcome};
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn sync_scheduler(start: DateTime<Utc>) -> (Arc<ManualClock>, TaskScheduler) {
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = TaskScheduler::new(None).with_clock(clock.clone());
        (clock, scheduler)
    }

    fn counting(name: &str, trigger: Trigger) -> (Arc<AtomicUsize>, ScheduledTask) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let task = ScheduledTask::new(name, trigger, move |_| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "run": n }))
        });
        (calls, task)
    }

    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<String>>,
    }

    impl TaskQueue for RecordingQueue {
        fn is_reachable(&self) -> bool {
            true
        }

        fn enqueue(&self, task: &str, _args: Value) -> Result<TaskId, QueueError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(task.to_owned());
            Ok(TaskId(sent.len() as u64))
        }
    }

    #[test]
    fn interval_fires_once_per_period() {
        let start = at(2024, 1, 1, 12, 0, 0);
        let (_clock, scheduler) = sync_scheduler(start);
        let (calls, task) = counting("update_point_caches", Trigger::Interval(Duration::from_secs(3600)));
        scheduler.register(task).unwrap();

        let secs = |n: i64| start + chrono::TimeDelta::seconds(n);
        assert!(scheduler.run_due_tasks(secs(3599)).is_empty());
        assert_eq!(scheduler.run_due_tasks(secs(3600)).len(), 1);
        assert!(scheduler.run_due_tasks(secs(3600)).is_empty());
        assert!(scheduler.run_due_tasks(secs(7199)).is_empty());
        assert_eq!(scheduler.run_due_tasks(secs(7200)).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cron_fires_once_per_matching_minute() {
        let (_clock, scheduler) = sync_scheduler(at(2024, 1, 1, 0, 0, 0));
        let (calls, task) = counting(
            "generate_daily_statistics",
            Trigger::Cron(CronSpec::new().hour(0).minute(5)),
        );
        scheduler.register(task).unwrap();

        assert!(scheduler.run_due_tasks(at(2024, 1, 2, 0, 4, 59)).is_empty());
        assert_eq!(scheduler.run_due_tasks(at(2024, 1, 2, 0, 5, 0)).len(), 1);
        assert!(scheduler.run_due_tasks(at(2024, 1, 2, 0, 5, 30)).is_empty());
        assert!(scheduler.run_due_tasks(at(2024, 1, 2, 0, 6, 0)).is_empty());
        assert_eq!(scheduler.run_due_tasks(at(2024, 1, 3, 0, 5, 1)).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn weekly_cron_ignores_other_days() {
        let (_clock, scheduler) = sync_scheduler(at(2024, 1, 1, 0, 0, 0));
        let (calls, task) = counting(
            "send_inactivity_notifications",
            Trigger::Cron(CronSpec::new().day_of_week(1).hour(9).minute(0)),
        );
        scheduler.register(task).unwrap();

        // Tuesday, then Monday.
        assert!(scheduler.run_due_tasks(at(2024, 1, 2, 9, 0, 0)).is_empty());
        assert_eq!(scheduler.run_due_tasks(at(2024, 1, 8, 9, 0, 0)).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_task_fires_again_next_period() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let (_clock, scheduler) = sync_scheduler(start);
        scheduler
            .register(ScheduledTask::new(
                "flaky",
                Trigger::Interval(Duration::from_secs(60)),
                |_| Err(TaskError::new("database unavailable")),
            ))
            .unwrap();

        for minute in 1..=2 {
            let handles = scheduler.run_due_tasks(start + chrono::TimeDelta::minutes(minute));
            assert_eq!(handles.len(), 1);
            assert_eq!(
                handles[0].outcome(),
                Some(&TaskOutcome::Failed {
                    error: "database unavailable".into()
                })
            );
        }
        assert_eq!(scheduler.state("flaky"), Some(TaskState::Failed));
    }

    #[test]
    fn synchronous_dispatch_returns_result_inline() {
        let (_clock, scheduler) = sync_scheduler(at(2024, 1, 1, 0, 0, 0));
        let (calls, task) = counting("t", Trigger::Interval(Duration::from_secs(60)));
        scheduler.register(task).unwrap();

        assert_eq!(scheduler.mode(), ExecutionMode::Synchronous);
        let handle = scheduler.dispatch("t", Value::Null).unwrap();
        assert_eq!(handle.outcome(), Some(&TaskOutcome::Succeeded(json!({"run": 1}))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state("t"), Some(TaskState::Succeeded));
    }

    #[test]
    fn asynchronous_dispatch_only_enqueues() {
        let queue = Arc::new(RecordingQueue::default());
        let clock = Arc::new(ManualClock::new(at(2024, 1, 1, 0, 0, 0)));
        let scheduler = TaskScheduler::new(Some(queue.clone() as Arc<dyn TaskQueue>))
            .with_clock(clock.clone());
        let (calls, task) = counting("t", Trigger::Interval(Duration::from_secs(60)));
        scheduler.register(task).unwrap();

        assert_eq!(scheduler.mode(), ExecutionMode::Asynchronous);
        let handles = scheduler.run_due_tasks(at(2024, 1, 1, 0, 1, 0));
        assert_eq!(
            handles,
            vec![Handle::Queued {
                task: "t".into(),
                id: TaskId(1)
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*queue.sent.lock().unwrap(), vec!["t".to_string()]);
    }

    #[test]
    fn registration_errors() {
        let (_clock, scheduler) = sync_scheduler(at(2024, 1, 1, 0, 0, 0));
        let (_, task) = counting("t", Trigger::Interval(Duration::from_secs(60)));
        scheduler.register(task.clone()).unwrap();
        assert_eq!(
            scheduler.register(task),
            Err(SchedulerError::DuplicateTask("t".into()))
        );

        let (_, zero) = counting("zero", Trigger::Interval(Duration::ZERO));
        assert!(matches!(
            scheduler.register(zero),
            Err(SchedulerError::InvalidTrigger { .. })
        ));
        let (_, bad_cron) = counting("bad", Trigger::Cron(CronSpec::new().hour(24)));
        assert!(matches!(
            scheduler.register(bad_cron),
            Err(SchedulerError::InvalidTrigger { .. })
        ));
        assert_eq!(scheduler.task_names(), vec!["t".to_string()]);
    }

    #[test]
    fn unknown_dispatch() {
        let (_clock, scheduler) = sync_scheduler(at(2024, 1, 1, 0, 0, 0));
        assert_eq!(
            scheduler.dispatch("missing", Value::Null),
            Err(SchedulerError::UnknownTask("missing".into()))
        );
    }

    #[test]
    fn due_tasks_run_in_name_order() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let (_clock, scheduler) = sync_scheduler(start);
        for name in ["c", "a", "b"] {
            let (_, task) = counting(name, Trigger::Interval(Duration::from_secs(60)));
            scheduler.register(task).unwrap();
        }
        let handles = scheduler.run_due_tasks(start + chrono::TimeDelta::minutes(1));
        let order: Vec<&str> = handles.iter().map(Handle::task).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }
}
