//! Execution modes and the dispatchers behind them.
//!
//! The mode is chosen once, when the scheduler is built: a reachable
//! [`TaskQueue`] selects [`ExecutionMode::Asynchronous`], anything else
//! selects [`ExecutionMode::Synchronous`]. It never changes afterwards, even
//! if the queue later goes away.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use super::registry::TaskRegistry;
use super::scheduler::SchedulerError;
use super::task::TaskOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs are handed to a task queue and complete later.
    Asynchronous,
    /// Runs execute on the caller's thread before dispatch returns.
    Synchronous,
}

impl ExecutionMode {
    /// Picks the mode for `queue`. Logs a warning when falling back to
    /// synchronous execution.
    pub fn detect(queue: Option<&dyn TaskQueue>) -> Self {
        match queue {
            Some(q) if q.is_reachable() => {
                info!("task queue reachable, running tasks asynchronously");
                Self::Asynchronous
            }
            Some(_) => {
                warn!("task queue unreachable, running tasks synchronously");
                Self::Synchronous
            }
            None => {
                warn!("no task queue configured, running tasks synchronously");
                Self::Synchronous
            }
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asynchronous => "asynchronous",
            Self::Synchronous => "synchronous",
        })
    }
}

/// Identifier a queue hands out for an accepted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a dispatch hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Handle {
    /// Accepted by the queue; the result is observed elsewhere.
    Queued { task: String, id: TaskId },
    /// Ran inline, or could not be queued.
    Completed { task: String, outcome: TaskOutcome },
}

impl Handle {
    pub fn task(&self) -> &str {
        match self {
            Self::Queued { task, .. } | Self::Completed { task, .. } => task,
        }
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match self {
            Self::Queued { .. } => None,
            Self::Completed { outcome, .. } => Some(outcome),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Queued { task, id } => json!({
                "task": task,
                "status": "queued",
                "id": id.0,
            }),
            Self::Completed { task, outcome } => json!({
                "task": task,
                "status": if outcome.is_success() { "succeeded" } else { "failed" },
                "result": outcome.clone().into_record(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,

    #[error("task queue unavailable: {0}")]
    Unavailable(String),
}

/// A place to hand runs off to, drained by workers elsewhere.
pub trait TaskQueue: Send + Sync {
    /// Checked once, at scheduler construction.
    fn is_reachable(&self) -> bool;

    fn enqueue(&self, task: &str, args: Value) -> Result<TaskId, QueueError>;
}

/// Strategy for turning a due or requested run into a [`Handle`].
pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    fn dispatch(
        &self,
        registry: &TaskRegistry,
        task: &str,
        args: Value,
    ) -> Result<Handle, SchedulerError>;
}

/// Runs the handler on the calling thread.
#[derive(Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Synchronous
    }

    fn dispatch(
        &self,
        registry: &TaskRegistry,
        task: &str,
        args: Value,
    ) -> Result<Handle, SchedulerError> {
        let outcome = registry.execute(task, &args, None)?;
        Ok(Handle::Completed {
            task: task.to_owned(),
            outcome,
        })
    }
}

/// Hands runs to a [`TaskQueue`].
pub struct QueueDispatcher {
    queue: Arc<dyn TaskQueue>,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }
}

impl Dispatcher for QueueDispatcher {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Asynchronous
    }

    fn dispatch(
        &self,
        _registry: &TaskRegistry,
        task: &str,
        args: Value,
    ) -> Result<Handle, SchedulerError> {
        match self.queue.enqueue(task, args) {
            Ok(id) => Ok(Handle::Queued {
                task: task.to_owned(),
                id,
            }),
            // The mode is fixed; a queue that fails later only fails this run.
            Err(e) => {
                error!(task, error = %e, "could not enqueue task");
                Ok(Handle::Completed {
                    task: task.to_owned(),
                    outcome: TaskOutcome::Failed {
                        error: e.to_string(),
                    },
                })
            }
        }
    }
}

/// Builds the dispatcher for `queue`, detecting the mode once.
pub fn select_dispatcher(queue: Option<Arc<dyn TaskQueue>>) -> Box<dyn Dispatcher> {
    match ExecutionMode::detect(queue.as_deref()) {
        ExecutionMode::Asynchronous => match queue {
            Some(queue) => Box::new(QueueDispatcher::new(queue)),
            None => Box::new(InlineDispatcher),
        },
        ExecutionMode::Synchronous => Box::new(InlineDispatcher),
    }
}
