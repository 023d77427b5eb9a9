//! In-process task queue drained by a bounded pool of blocking workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{QueueError, TaskId, TaskQueue};
use super::registry::{AppContext, TaskRegistry};
use super::scheduler::SchedulerError;

struct Job {
    id: TaskId,
    task: String,
    args: Value,
}

/// A [`TaskQueue`] backed by a tokio channel.
///
/// Each job runs on the blocking thread pool, inside the [`AppContext`]
/// given at start-up, with at most `workers` jobs in flight.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Starts the pool on the current tokio runtime.
    ///
    /// The returned handle finishes once the pool is [closed](Self::close)
    /// and every accepted job has run.
    pub fn start(
        registry: Arc<TaskRegistry>,
        context: Arc<dyn AppContext>,
        workers: usize,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            next_id: AtomicU64::new(1),
        });
        let handle = tokio::spawn(drain(rx, registry, context, workers.max(1)));
        info!(workers = workers.max(1), "worker pool started");
        (pool, handle)
    }

    /// Stops accepting jobs. Jobs already queued still run.
    pub fn close(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
        {
            info!("worker pool closed");
        }
    }
}

impl TaskQueue for WorkerPool {
    fn is_reachable(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn enqueue(&self, task: &str, args: Value) -> Result<TaskId, QueueError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = sender.as_ref().ok_or(QueueError::Closed)?;
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tx.send(Job {
            id,
            task: task.to_owned(),
            args,
        })
        .map_err(|_| QueueError::Closed)?;
        debug!(task, %id, "task enqueued");
        Ok(id)
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<Job>,
    registry: Arc<TaskRegistry>,
    context: Arc<dyn AppContext>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let registry = Arc::clone(&registry);
        let context = Arc::clone(&context);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_job(&registry, context.as_ref(), job);
        });
    }

    // Wait for in-flight jobs by taking every permit back.
    let total = u32::try_from(workers).unwrap_or(u32::MAX);
    if permits.acquire_many(total).await.is_ok() {
        info!("worker pool drained");
    }
}

fn run_job(registry: &TaskRegistry, context: &dyn AppContext, job: Job) {
    match registry.execute(&job.task, &job.args, Some(context)) {
        Ok(outcome) if outcome.is_success() => {
            info!(task = %job.task, id = %job.id, "queued task succeeded");
        }
        Ok(_) => {
            // The failure itself was logged where the handler ran.
            warn!(task = %job.task, id = %job.id, "queued task failed");
        }
        Err(SchedulerError::AlreadyRunning(_)) => {
            warn!(task = %job.task, id = %job.id, "previous run still in progress, dropping job");
        }
        Err(e) => error!(task = %job.task, id = %job.id, error = %e, "queued task rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::task::{ScheduledTask, TaskError, Trigger};
    use crate::background::{ExecutionMode, Handle, TaskScheduler, TaskState};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingContext {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl AppContext for CountingContext {
        fn acquire(&self) -> Result<(), TaskError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn queued_jobs_run_inside_context() {
        let registry = Arc::new(TaskRegistry::new());
        let context = Arc::new(CountingContext::default());
        let (pool, drained) = WorkerPool::start(registry.clone(), context.clone(), 2);
        let scheduler = TaskScheduler::with_registry(
            registry.clone(),
            Some(pool.clone() as Arc<dyn TaskQueue>),
        );
        assert_eq!(scheduler.mode(), ExecutionMode::Asynchronous);

        let totals = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&totals);
        scheduler
            .register(ScheduledTask::new(
                "sum",
                Trigger::Interval(Duration::from_secs(60)),
                move |args| {
                    let n = args["n"].as_i64().unwrap_or(0);
                    seen.lock().unwrap().push(n);
                    Ok(json!(n))
                },
            ))
            .unwrap();

        let handle = scheduler.dispatch("sum", json!({"n": 5})).unwrap();
        assert!(matches!(handle, Handle::Queued { id: TaskId(1), .. }));

        pool.close();
        drained.await.unwrap();

        assert_eq!(*totals.lock().unwrap(), vec![5]);
        assert_eq!(registry.state("sum"), Some(TaskState::Succeeded));
        assert_eq!(context.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(context.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_jobs() {
        let registry = Arc::new(TaskRegistry::new());
        let (pool, drained) =
            WorkerPool::start(registry, Arc::new(CountingContext::default()), 1);
        assert!(pool.is_reachable());

        pool.close();
        assert!(!pool.is_reachable());
        assert!(matches!(pool.enqueue("x", Value::Null), Err(QueueError::Closed)));
        drained.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_queued_task_is_logged_not_fatal() {
        let registry = Arc::new(TaskRegistry::new());
        let context = Arc::new(CountingContext::default());
        let (pool, drained) = WorkerPool::start(registry, context.clone(), 1);

        pool.enqueue("ghost", Value::Null).unwrap();
        pool.close();
        drained.await.unwrap();
        assert_eq!(context.acquired.load(Ordering::SeqCst), 0);
    }
}
