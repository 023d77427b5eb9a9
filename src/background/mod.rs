//! Background work: scheduled tasks and how they get executed.
//!
//! - [`task`]: what a task is ([`ScheduledTask`], [`Trigger`], [`CronSpec`]).
//! - [`registry`]: the single-flight execution path every run goes through.
//! - [`dispatch`]: [`ExecutionMode`] and the inline / queued dispatchers.
//! - [`scheduler`]: due-time evaluation ([`TaskScheduler`]).
//! - [`worker`]: an in-process [`TaskQueue`] drained by a worker pool.
//! - [`beat`]: the periodic driver.
//!
//! With no reachable queue at start-up the scheduler runs every task inline
//! and says so once in the log.

pub mod beat;
pub mod dispatch;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use beat::Beat;
pub use dispatch::{
    Dispatcher, ExecutionMode, Handle, InlineDispatcher, QueueDispatcher, QueueError, TaskId,
    TaskQueue, select_dispatcher,
};
pub use registry::{AppContext, TaskRegistry, TaskState};
pub use scheduler::{SchedulerError, TaskScheduler};
pub use task::{CronField, CronSpec, ScheduledTask, TaskError, TaskHandler, TaskOutcome, Trigger};
pub use worker::WorkerPool;
