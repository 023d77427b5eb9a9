//! Periodic driver that asks the scheduler for due tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use super::scheduler::TaskScheduler;

/// Ticks every `period` and runs [`TaskScheduler::run_due_tasks`] on the
/// blocking pool. Ticks do not wait for the previous evaluation; overlapping
/// runs of one task are refused by the registry. On stop, the loop waits for
/// evaluations still in flight, including inline task runs.
pub struct Beat {
    scheduler: Arc<TaskScheduler>,
    period: Duration,
}

impl Beat {
    pub fn new(scheduler: Arc<TaskScheduler>, period: Duration) -> Self {
        Self {
            scheduler,
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// Spawns the loop. It stops when `shutdown` flips to `true` or its
    /// sender is dropped, and the handle resolves once in-flight ticks finish.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut runs = JoinSet::new();
            info!(period_ms = self.period.as_millis() as u64, "beat started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(finished) = runs.join_next(), if !runs.is_empty() => {
                        log_tick(finished);
                    }
                    _ = ticker.tick() => {
                        let scheduler = Arc::clone(&self.scheduler);
                        runs.spawn_blocking(move || {
                            let handles = scheduler.run_due_tasks(scheduler.now());
                            if !handles.is_empty() {
                                debug!(dispatched = handles.len(), "beat dispatched tasks");
                            }
                        });
                    }
                }
            }

            if !runs.is_empty() {
                info!(in_flight = runs.len(), "beat waiting for running ticks");
            }
            while let Some(finished) = runs.join_next().await {
                log_tick(finished);
            }
            info!("beat stopped");
        })
    }
}

fn log_tick(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "beat tick failed");
    }
}
