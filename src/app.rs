//! Application assembly: limiter, caches, scheduler and routes.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::background::{
    Beat, Handle, SchedulerError, TaskQueue, TaskRegistry, TaskScheduler, WorkerPool,
};
use crate::cache::{LEADERBOARD_KEY, PointCaches, ResponseCacheMiddleware, get_or_insert_with, user_points_key};
use crate::clock::Clock;
use crate::config::{AppConfig, ConfigError};
use crate::context::Context;
use crate::middleware::{LoggerMiddleware, Pipeline};
use crate::points::jobs::{JobEnv, register_default_jobs};
use crate::points::{Ledger, LedgerContext, leaderboard, total_points};
use crate::security::{PolicyError, RateLimitMiddleware, RateLimiter};
use crate::{Response, Router, StatusCode};

/// Scope of the stricter limit on the task endpoints.
pub const TASKS_SCOPE: &str = "tasks";

const DEFAULT_LEADERBOARD_SIZE: usize = 10;
const MAX_LEADERBOARD_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// The assembled service.
pub struct App {
    config: AppConfig,
    pipeline: Pipeline,
    scheduler: Arc<TaskScheduler>,
    limiter: Arc<RateLimiter>,
    caches: PointCaches,
    workers: Option<(Arc<WorkerPool>, JoinHandle<()>)>,
}

impl App {
    /// Builds the service over `ledger`.
    ///
    /// With `config.task_queue` set and a tokio runtime available, an
    /// in-process worker pool is started and tasks run asynchronously;
    /// otherwise they run synchronously.
    pub fn build(
        config: AppConfig,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let registry = Arc::new(TaskRegistry::new());
        let workers = if config.task_queue {
            start_workers(&registry, &ledger, config.workers)
        } else {
            None
        };
        let queue = workers
            .as_ref()
            .map(|(pool, _)| Arc::clone(pool) as Arc<dyn TaskQueue>);
        let scheduler =
            Arc::new(TaskScheduler::with_registry(registry, queue).with_clock(clock.clone()));

        let caches = PointCaches::with_timeout(config.cache_timeout(), clock.clone());
        let env = JobEnv {
            ledger: ledger.clone(),
            caches: caches.clone(),
            clock: clock.clone(),
        };
        register_default_jobs(&scheduler, &env)?;

        let limiter = Arc::new(RateLimiter::with_clock(clock));
        let task_policy = config
            .task_rate_limit
            .policy()?
            .with_scope(|| TASKS_SCOPE.to_owned());

        let router = routes(&scheduler, &ledger, &caches, config.user_points_timeout());
        let pipeline = Pipeline::new(router)
            .layer(LoggerMiddleware)
            .layer(RateLimitMiddleware::new(
                limiter.clone(),
                config.rate_limit.policy()?,
            ))
            .layer(RateLimitMiddleware::new(limiter.clone(), task_policy).only_under("/tasks"))
            .layer(
                ResponseCacheMiddleware::new(
                    caches.responses.clone(),
                    LEADERBOARD_KEY,
                    config.leaderboard_timeout(),
                )
                .only_under("/leaderboard"),
            );

        Ok(Self {
            config,
            pipeline,
            scheduler,
            limiter,
            caches,
            workers,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn caches(&self) -> &PointCaches {
        &self.caches
    }

    pub fn beat(&self) -> Beat {
        Beat::new(Arc::clone(&self.scheduler), self.config.beat_tick())
    }

    /// Stops the worker pool, if any, after its queued jobs finish.
    pub async fn shutdown(self) {
        if let Some((pool, drained)) = self.workers {
            pool.close();
            if let Err(e) = drained.await {
                error!(error = %e, "worker pool did not drain cleanly");
            }
        }
    }
}

fn start_workers(
    registry: &Arc<TaskRegistry>,
    ledger: &Arc<dyn Ledger>,
    workers: usize,
) -> Option<(Arc<WorkerPool>, JoinHandle<()>)> {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("no async runtime, task queue not started");
        return None;
    }
    let context = Arc::new(LedgerContext::new(Arc::clone(ledger)));
    Some(WorkerPool::start(Arc::clone(registry), context, workers))
}

fn error_response(status: StatusCode, message: impl Display) -> Response {
    Response::json(status, &json!({ "error": message.to_string() }))
}

fn routes(
    scheduler: &Arc<TaskScheduler>,
    ledger: &Arc<dyn Ledger>,
    caches: &PointCaches,
    user_points_ttl: Duration,
) -> Router {
    let mut router = Router::new();

    let s = Arc::clone(scheduler);
    router.get("/health", move |_ctx| {
        let mode = s.mode();
        async move {
            Response::json(
                StatusCode::Ok,
                &json!({ "status": "ok", "execution_mode": mode }),
            )
        }
    });

    let l = Arc::clone(ledger);
    router.get("/leaderboard", move |ctx: Context| {
        let ledger = Arc::clone(&l);
        async move {
            let limit = ctx
                .request()
                .query_param("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_LEADERBOARD_SIZE)
                .min(MAX_LEADERBOARD_SIZE);
            match leaderboard(ledger.as_ref(), limit) {
                Ok(entries) => Response::json(StatusCode::Ok, &json!({ "leaderboard": entries })),
                Err(e) => error_response(StatusCode::ServiceUnavailable, e),
            }
        }
    });

    let l = Arc::clone(ledger);
    let c = caches.clone();
    router.get("/users/:id/points", move |ctx: Context| {
        let ledger = Arc::clone(&l);
        let caches = c.clone();
        async move { user_points(&ctx, ledger.as_ref(), &caches, user_points_ttl) }
    });

    let s = Arc::clone(scheduler);
    router.get("/tasks", move |_ctx| {
        let scheduler = Arc::clone(&s);
        async move { Response::json(StatusCode::Ok, &task_listing(&scheduler)) }
    });

    let s = Arc::clone(scheduler);
    router.post("/tasks/:name", move |ctx: Context| {
        let scheduler = Arc::clone(&s);
        async move { dispatch_task(ctx, scheduler).await }
    });

    router
}

fn user_points(
    ctx: &Context,
    ledger: &dyn Ledger,
    caches: &PointCaches,
    ttl: Duration,
) -> Response {
    let Some(id) = ctx.params().get("id").and_then(|v| v.parse::<u64>().ok()) else {
        return error_response(StatusCode::BadRequest, "user id must be a number");
    };
    let user = match ledger.user(id) {
        Ok(Some(user)) => user,
        Ok(None) => return error_response(StatusCode::NotFound, format!("no user with id {id}")),
        Err(e) => return error_response(StatusCode::ServiceUnavailable, e),
    };

    let points = get_or_insert_with(
        caches.user_points.as_ref(),
        &user_points_key(id),
        Some(ttl),
        || total_points(ledger, &user),
    );
    match points {
        Ok(points) => Response::json(
            StatusCode::Ok,
            &json!({ "user_id": id, "role": user.role, "points": points }),
        ),
        Err(e) => error_response(StatusCode::ServiceUnavailable, e),
    }
}

fn task_listing(scheduler: &TaskScheduler) -> Value {
    let registry = scheduler.registry();
    let tasks: Vec<Value> = scheduler
        .task_names()
        .into_iter()
        .map(|name| {
            json!({
                "trigger": registry.get(&name).map(|t| t.trigger().to_string()),
                "state": registry.state(&name),
                "name": name,
            })
        })
        .collect();
    json!({ "execution_mode": scheduler.mode(), "tasks": tasks })
}

async fn dispatch_task(ctx: Context, scheduler: Arc<TaskScheduler>) -> Response {
    let Some(name) = ctx.params().get("name").map(str::to_owned) else {
        return error_response(StatusCode::NotFound, "missing task name");
    };
    let args: Value = match ctx.json() {
        Ok(args) => args,
        Err(e) => return error_response(StatusCode::BadRequest, format!("invalid JSON body: {e}")),
    };

    // Synchronous mode runs the handler here, so keep it off the reactor.
    let dispatched = tokio::task::spawn_blocking(move || scheduler.dispatch(&name, args)).await;
    match dispatched {
        Ok(Ok(handle @ Handle::Queued { .. })) => Response::json(StatusCode::Accepted, &handle.to_json()),
        Ok(Ok(handle)) => Response::json(StatusCode::Ok, &handle.to_json()),
        Ok(Err(e @ SchedulerError::UnknownTask(_))) => error_response(StatusCode::NotFound, e),
        Ok(Err(e @ SchedulerError::AlreadyRunning(_))) => error_response(StatusCode::Conflict, e),
        Ok(Err(e)) => error_response(StatusCode::InternalServerError, e),
        Err(e) => {
            error!(error = %e, "task dispatch panicked");
            error_response(StatusCode::InternalServerError, "task dispatch failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{ExecutionMode, TaskState};
    use crate::clock::ManualClock;
    use crate::http::request::Request;
    use crate::points::jobs::{GENERATE_DAILY_STATISTICS, UPDATE_POINT_CACHES};
    use crate::points::{MemoryLedger, Role};
    use chrono::{TimeZone, Utc};
    use std::net::SocketAddr;

    fn request(method: &str, path: &str, peer: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (mut req, _) = Request::parse(raw.as_bytes()).unwrap();
        req.set_remote_addr(peer.parse::<SocketAddr>().unwrap());
        req
    }

    fn body(resp: &Response) -> Value {
        serde_json::from_slice(resp.content()).unwrap()
    }

    struct Fixture {
        app: App,
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: AppConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 9, 12, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(MemoryLedger::new());
        let teacher = ledger.add_user(Role::Teacher, "Ada", "Byron", "ada@school.test");
        let a = ledger.add_user(Role::Student, "Sam", "Lee", "sam@school.test");
        let b = ledger.add_user(Role::Student, "Kim", "Ng", "kim@school.test");
        ledger.award(teacher.id, a.id, 3, clock.now()).unwrap();
        ledger.award(teacher.id, b.id, 7, clock.now()).unwrap();

        let app = App::build(config, ledger.clone(), clock.clone()).unwrap();
        Fixture { app, ledger, clock }
    }

    fn sync_config() -> AppConfig {
        AppConfig {
            task_queue: false,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn health_reports_mode() {
        let f = fixture(sync_config());
        let resp = f.app.pipeline().handle(request("GET", "/health", "10.0.0.1:1")).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(body(&resp), json!({ "status": "ok", "execution_mode": "synchronous" }));
        assert_eq!(resp.headers().get("x-ratelimit-limit"), Some("100"));
    }

    #[tokio::test]
    async fn leaderboard_is_cached_until_points_job_runs() {
        let f = fixture(sync_config());
        let pipeline = f.app.pipeline().clone();

        let first = pipeline.handle(request("GET", "/leaderboard", "10.0.0.1:1")).await;
        assert_eq!(first.headers().get("x-cache"), Some("miss"));
        assert_eq!(body(&first)["leaderboard"][0]["points"], json!(7));

        f.ledger.award(1, 2, 10, f.clock.now()).unwrap();
        let second = pipeline.handle(request("GET", "/leaderboard", "10.0.0.1:1")).await;
        assert_eq!(second.headers().get("x-cache"), Some("hit"));
        assert_eq!(body(&second)["leaderboard"][0]["points"], json!(7));

        f.app
            .scheduler()
            .dispatch(UPDATE_POINT_CACHES, Value::Null)
            .unwrap();
        let third = pipeline.handle(request("GET", "/leaderboard", "10.0.0.1:1")).await;
        assert_eq!(third.headers().get("x-cache"), Some("miss"));
        assert_eq!(body(&third)["leaderboard"][0]["points"], json!(13));
    }

    #[tokio::test]
    async fn user_points_are_memoized() {
        let f = fixture(sync_config());
        let pipeline = f.app.pipeline().clone();

        let resp = pipeline.handle(request("GET", "/users/2/points", "10.0.0.1:1")).await;
        assert_eq!(body(&resp), json!({ "user_id": 2, "role": "student", "points": 3 }));

        f.ledger.award(1, 2, 1, f.clock.now()).unwrap();
        let resp = pipeline.handle(request("GET", "/users/2/points", "10.0.0.1:1")).await;
        assert_eq!(body(&resp)["points"], json!(3));

        f.clock.advance(Duration::from_secs(300));
        let resp = pipeline.handle(request("GET", "/users/2/points", "10.0.0.1:1")).await;
        assert_eq!(body(&resp)["points"], json!(4));

        let resp = pipeline.handle(request("GET", "/users/99/points", "10.0.0.1:1")).await;
        assert_eq!(resp.status(), StatusCode::NotFound);
        let resp = pipeline.handle(request("GET", "/users/abc/points", "10.0.0.1:1")).await;
        assert_eq!(resp.status(), StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn synchronous_task_dispatch_returns_result() {
        let f = fixture(sync_config());
        let resp = f
            .app
            .pipeline()
            .handle(request("POST", "/tasks/generate_daily_statistics", "10.0.0.1:1"))
            .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let record = body(&resp);
        assert_eq!(record["status"], json!("succeeded"));
        assert_eq!(record["result"]["transactions_count"], json!(0));
        assert_eq!(
            f.app.scheduler().state(GENERATE_DAILY_STATISTICS),
            Some(TaskState::Succeeded)
        );

        let resp = f
            .app
            .pipeline()
            .handle(request("POST", "/tasks/nope", "10.0.0.1:1"))
            .await;
        assert_eq!(resp.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn task_endpoint_has_its_own_stricter_limit() {
        let mut config = sync_config();
        config.task_rate_limit.limit = 2;
        let f = fixture(config);
        let pipeline = f.app.pipeline().clone();

        for _ in 0..2 {
            let resp = pipeline.handle(request("GET", "/tasks", "10.0.0.7:1")).await;
            assert_eq!(resp.status(), StatusCode::Ok);
        }
        let resp = pipeline.handle(request("GET", "/tasks", "10.0.0.7:1")).await;
        assert_eq!(resp.status(), StatusCode::TooManyRequests);

        // Same peer, other routes, still under the global limit.
        let resp = pipeline.handle(request("GET", "/health", "10.0.0.7:1")).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(f.app.limiter().window("10.0.0.7:tasks").len(), 2);
    }

    #[tokio::test]
    async fn queue_mode_enqueues_and_workers_run_in_ledger_session() {
        let f = fixture(AppConfig {
            task_queue: true,
            workers: 1,
            ..AppConfig::default()
        });
        assert_eq!(f.app.scheduler().mode(), ExecutionMode::Asynchronous);

        let resp = f
            .app
            .pipeline()
            .handle(request("POST", "/tasks/update_point_caches", "10.0.0.1:1"))
            .await;
        assert_eq!(resp.status(), StatusCode::Accepted);
        assert_eq!(body(&resp)["status"], json!("queued"));

        let scheduler = Arc::clone(f.app.scheduler());
        f.app.shutdown().await;
        assert_eq!(scheduler.state(UPDATE_POINT_CACHES), Some(TaskState::Succeeded));
        assert_eq!(f.ledger.stored_total(2).unwrap(), Some(3));
        assert_eq!(f.ledger.open_sessions(), 0);
    }

    #[test]
    fn without_runtime_falls_back_to_synchronous() {
        let f = fixture(AppConfig::default());
        assert_eq!(f.app.scheduler().mode(), ExecutionMode::Synchronous);
        assert_eq!(f.app.scheduler().task_names().len(), 3);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fallback_to_synchronous_warns_once() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let app = tracing::subscriber::with_default(subscriber, || {
            App::build(
                AppConfig::default(),
                Arc::new(MemoryLedger::new()),
                Arc::new(ManualClock::new(Utc::now())),
            )
        })
        .unwrap();
        assert_eq!(app.scheduler().mode(), ExecutionMode::Synchronous);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warnings: Vec<_> = output.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 1, "{output}");
        assert!(warnings[0].contains("running tasks synchronously"));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let mut config = sync_config();
        config.rate_limit.per_secs = 0;
        let err = App::build(config, Arc::new(MemoryLedger::new()), Arc::new(ManualClock::new(Utc::now())))
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Config(ConfigError::Policy(PolicyError::ZeroWindow))));
    }
}
