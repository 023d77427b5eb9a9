//! The periodic jobs of the points service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::{Value, json};
use tracing::info;

use super::{Ledger, Role, total_points};
use crate::background::{CronSpec, ScheduledTask, SchedulerError, TaskError, TaskScheduler, Trigger};
use crate::cache::PointCaches;
use crate::clock::Clock;

pub const UPDATE_POINT_CACHES: &str = "update_point_caches";
pub const GENERATE_DAILY_STATISTICS: &str = "generate_daily_statistics";
pub const SEND_INACTIVITY_NOTIFICATIONS: &str = "send_inactivity_notifications";

/// Teachers with no transaction for this many days are reported inactive.
const INACTIVITY_DAYS: i64 = 7;

/// What the jobs read from and write to.
#[derive(Clone)]
pub struct JobEnv {
    pub ledger: Arc<dyn Ledger>,
    pub caches: PointCaches,
    pub clock: Arc<dyn Clock>,
}

/// Recomputes every user's total, stores it, and drops the cached totals
/// and leaderboards built from the old numbers.
pub fn update_point_caches(env: &JobEnv) -> Result<Value, TaskError> {
    let mut totals = Vec::new();
    for role in [Role::Student, Role::Teacher] {
        for user in env.ledger.users_with_role(role)? {
            totals.push((user.id, total_points(env.ledger.as_ref(), &user)?));
        }
    }
    env.ledger.store_totals(&totals)?;
    let invalidated = env.caches.invalidate_points();
    info!(users = totals.len(), invalidated, "point caches updated");

    Ok(json!({
        "success": true,
        "timestamp": env.clock.now().to_rfc3339(),
    }))
}

/// Activity over the day before now.
pub fn generate_daily_statistics(env: &JobEnv) -> Result<Value, TaskError> {
    let now = env.clock.now();
    let yesterday = now - TimeDelta::days(1);
    let transactions = env.ledger.transactions_between(yesterday, now)?;

    let total_points: i64 = transactions.iter().map(|tx| tx.points).sum();
    let teachers: HashSet<u64> = transactions.iter().map(|tx| tx.teacher_id).collect();
    let students: HashSet<u64> = transactions.iter().map(|tx| tx.student_id).collect();
    info!(
        transactions = transactions.len(),
        total_points, "daily statistics generated"
    );

    Ok(json!({
        "timestamp": now.to_rfc3339(),
        "date": yesterday.date_naive().to_string(),
        "transactions_count": transactions.len(),
        "total_points": total_points,
        "active_teachers": teachers.len(),
        "active_students": students.len(),
    }))
}

/// Lists teachers who have not awarded points within the threshold.
pub fn send_inactivity_notifications(env: &JobEnv) -> Result<Value, TaskError> {
    let threshold = env.clock.now() - TimeDelta::days(INACTIVITY_DAYS);

    let mut inactive = Vec::new();
    for teacher in env.ledger.users_with_role(Role::Teacher)? {
        let last = env.ledger.last_transaction_by(teacher.id)?;
        if last.as_ref().is_none_or(|tx| tx.created_at < threshold) {
            info!(teacher_id = teacher.id, email = %teacher.email, "teacher inactive");
            inactive.push(json!({
                "id": teacher.id,
                "name": teacher.full_name(),
                "email": teacher.email,
                "last_activity": last.map(|tx| tx.created_at.to_rfc3339()),
            }));
        }
    }

    Ok(json!({
        "inactive_teacher_count": inactive.len(),
        "teachers": inactive,
    }))
}

/// The service's beat schedule.
pub fn default_jobs(env: &JobEnv) -> Vec<ScheduledTask> {
    let hourly = env.clone();
    let daily = env.clone();
    let weekly = env.clone();
    vec![
        ScheduledTask::new(
            UPDATE_POINT_CACHES,
            Trigger::Interval(Duration::from_secs(3600)),
            move |_| update_point_caches(&hourly),
        ),
        ScheduledTask::new(
            GENERATE_DAILY_STATISTICS,
            Trigger::Cron(CronSpec::new().hour(0).minute(5)),
            move |_| generate_daily_statistics(&daily),
        ),
        ScheduledTask::new(
            SEND_INACTIVITY_NOTIFICATIONS,
            Trigger::Cron(CronSpec::new().day_of_week(1).hour(9).minute(0)),
            move |_| send_inactivity_notifications(&weekly),
        ),
    ]
}

pub fn register_default_jobs(scheduler: &TaskScheduler, env: &JobEnv) -> Result<(), SchedulerError> {
    default_jobs(env)
        .into_iter()
        .try_for_each(|task| scheduler.register(task))
}
