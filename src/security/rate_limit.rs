//! Sliding-window rate limiting.
//!
//! [`RateLimiter`] keeps one window of request timestamps per key behind a
//! single mutex. A check filters out stale timestamps, compares the remaining
//! count against the policy limit and only records the attempt when it is
//! allowed, so rejected requests never extend a client's penalty.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

/// Produces an extra key component appended to the client identity.
pub type ScopeFn = Arc<dyn Fn() -> String + Send + Sync + 'static>;

/// Errors raised when building a [`RateLimitPolicy`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("rate limit must allow at least one request per window")]
    ZeroLimit,

    #[error("rate limit window must be longer than zero seconds")]
    ZeroWindow,

    #[error("rate limit window of {0:?} is out of range")]
    WindowOutOfRange(Duration),
}

/// How many requests a key may make in a trailing window.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tally::security::RateLimitPolicy;
///
/// let policy = RateLimitPolicy::new(100, Duration::from_secs(60))
///     .unwrap()
///     .with_scope(|| "login".to_string());
/// assert_eq!(policy.limit(), 100);
/// ```
#[derive(Clone)]
pub struct RateLimitPolicy {
    limit: usize,
    per: Duration,
    window: TimeDelta,
    scope: Option<ScopeFn>,
}

impl RateLimitPolicy {
    /// Creates a policy allowing `limit` requests every `per`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if `limit` is zero or `per` is zero or too
    /// large to represent as a calendar offset.
    pub fn new(limit: usize, per: Duration) -> Result<Self, PolicyError> {
        if limit == 0 {
            return Err(PolicyError::ZeroLimit);
        }
        if per.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        let window = TimeDelta::from_std(per).map_err(|_| PolicyError::WindowOutOfRange(per))?;
        Ok(Self {
            limit,
            per,
            window,
            scope: None,
        })
    }

    /// Adds a scope function; its output is appended to the identity as
    /// `identity:scope`.
    #[must_use]
    pub fn with_scope<F>(mut self, scope: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.scope = Some(Arc::new(scope));
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    fn key_for(&self, identity: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{identity}:{}", scope()),
            None => identity.to_owned(),
        }
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("limit", &self.limit)
            .field("per", &self.per)
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

/// Result of [`RateLimiter::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was recorded. `remaining` more fit in the current window.
    Allowed { remaining: usize },
    /// The window is full. The oldest recorded request leaves it after
    /// `retry_after`.
    Rejected { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Per-process sliding-window rate limiter.
///
/// Construct once at startup and share it by `Arc` with every handler that
/// needs it.
pub struct RateLimiter {
    windows: Mutex<Windows>,
    clock: Arc<dyn Clock>,
}

/// Key count below which stale windows are left alone.
const SWEEP_FLOOR: usize = 1024;

struct Window {
    per: TimeDelta,
    stamps: Vec<DateTime<Utc>>,
}

impl Window {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.stamps
            .last()
            .is_none_or(|&t| now.signed_duration_since(t) >= self.per)
    }
}

/// Key map plus the size at which the next sweep of stale keys runs. The
/// threshold doubles with the live key count, so sweeps stay amortised O(1).
struct Windows {
    by_key: HashMap<String, Window>,
    sweep_at: usize,
}

impl Windows {
    fn sweep(&mut self, now: DateTime<Utc>) {
        let before = self.by_key.len();
        self.by_key.retain(|_, w| !w.is_stale(now));
        self.sweep_at = (self.by_key.len() * 2).max(SWEEP_FLOOR);
        debug!(
            dropped = before - self.by_key.len(),
            kept = self.by_key.len(),
            "swept stale rate-limit windows"
        );
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Creates a limiter that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a limiter that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(Windows {
                by_key: HashMap::new(),
                sweep_at: SWEEP_FLOOR,
            }),
            clock,
        }
    }

    /// Checks `identity` against `policy` and records the attempt if it fits.
    ///
    /// The filter, comparison and append happen under one lock, so two
    /// concurrent callers can never both take the last slot.
    pub fn check_and_record(&self, identity: &str, policy: &RateLimitPolicy) -> Decision {
        let key = policy.key_for(identity);
        let now = self.clock.now();

        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !windows.by_key.contains_key(&key) && windows.by_key.len() >= windows.sweep_at {
            windows.sweep(now);
        }
        let window = windows.by_key.entry(key).or_insert_with(|| Window {
            per: policy.window,
            stamps: Vec::new(),
        });
        window.per = policy.window;
        window.stamps.retain(|&t| now.signed_duration_since(t) < policy.window);

        if window.stamps.len() >= policy.limit {
            let retry_after = window
                .stamps
                .first()
                .map(|&oldest| {
                    (oldest + policy.window - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(policy.per);
            debug!(identity, limit = policy.limit, ?retry_after, "rate limit exceeded");
            return Decision::Rejected { retry_after };
        }

        window.stamps.push(now);
        Decision::Allowed {
            remaining: policy.limit - window.stamps.len(),
        }
    }

    /// Number of keys currently holding a window, stale ones included until
    /// the next sweep.
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_key
            .len()
    }

    /// Returns a copy of the stored window for `key` (the composed
    /// `identity[:scope]`), without purging.
    pub fn window(&self, key: &str) -> Vec<DateTime<Utc>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_key
            .get(key)
            .map(|w| w.stamps.clone())
            .unwrap_or_default()
    }
}
