//! Process-wide task registry and the single-flight execution path.
//!
//! Every handler invocation, inline or from the worker pool, goes through
//! [`TaskRegistry::execute`]. It refuses to start a task whose previous run
//! has not finished and records each task's [`TaskState`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use super::scheduler::SchedulerError;
use super::task::{ScheduledTask, TaskError, TaskOutcome};

/// Lifecycle of one task name.
///
/// `Registered → Running → {Succeeded, Failed}`, then back to `Running` on
/// the next firing. The terminal states only describe the latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Registered,
    Running,
    Succeeded,
    Failed,
}

/// The application environment a queued task runs in.
///
/// [`acquire`](Self::acquire) is called before the handler and
/// [`release`](Self::release) after it, even if the handler panics.
pub trait AppContext: Send + Sync {
    fn acquire(&self) -> Result<(), TaskError>;
    fn release(&self);
}

struct ContextScope<'a>(&'a dyn AppContext);

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<ScheduledTask>>>,
    states: Mutex<HashMap<String, TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `task`. Names are unique for the life of the process.
    pub(crate) fn insert(&self, task: ScheduledTask) -> Result<(), SchedulerError> {
        let mut tasks = self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tasks.contains_key(task.name()) {
            return Err(SchedulerError::DuplicateTask(task.name().to_owned()));
        }
        self.states()
            .insert(task.name().to_owned(), TaskState::Registered);
        tasks.insert(task.name().to_owned(), Arc::new(task));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScheduledTask>> {
        self.tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.states().get(name).copied()
    }

    /// Runs `name` on the calling thread, inside `context` when given.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::UnknownTask`] — no task has that name.
    /// - [`SchedulerError::AlreadyRunning`] — a run of the same task is in
    ///   flight.
    ///
    /// Handler failures are not errors here; they come back as
    /// [`TaskOutcome::Failed`].
    pub fn execute(
        &self,
        name: &str,
        args: &Value,
        context: Option<&dyn AppContext>,
    ) -> Result<TaskOutcome, SchedulerError> {
        let task = self
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_owned()))?;
        let mut flight = self.begin_flight(name)?;
        debug!(task = name, "task started");

        let outcome = match context {
            Some(ctx) => match ctx.acquire() {
                Ok(()) => {
                    let _scope = ContextScope(ctx);
                    task.run(args)
                }
                Err(e) => {
                    error!(task = name, error = %e, "could not enter application context");
                    TaskOutcome::Failed { error: e.0 }
                }
            },
            None => task.run(args),
        };

        flight.finish(&outcome);
        Ok(outcome)
    }

    fn begin_flight<'a>(&'a self, name: &'a str) -> Result<Flight<'a>, SchedulerError> {
        let mut states = self.states();
        let state = states
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_owned()))?;
        if *state == TaskState::Running {
            return Err(SchedulerError::AlreadyRunning(name.to_owned()));
        }
        *state = TaskState::Running;
        Ok(Flight {
            registry: self,
            name,
            result: TaskState::Failed,
        })
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, TaskState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Clears the Running mark on drop, so a run that unwinds still frees the
// task name for the next firing.
struct Flight<'a> {
    registry: &'a TaskRegistry,
    name: &'a str,
    result: TaskState,
}

impl Flight<'_> {
    fn finish(&mut self, outcome: &TaskOutcome) {
        self.result = if outcome.is_success() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.registry.states().get_mut(self.name) {
            *state = self.result;
        }
    }
}
