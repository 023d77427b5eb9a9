//! Caching layer — an in-memory TTL store and response caching.
//!
//! [`Cache`] is the capability set the rest of the crate depends on:
//! `get`, `set`, `delete` and `delete_by_prefix`. [`MemoryCache`] implements
//! it with a mutex-guarded map whose entries expire lazily when read.
//!
//! The points service caches two things:
//!
//! - per-user point totals, memoized under [`user_points_key`] for
//!   [`USER_POINTS_TIMEOUT`];
//! - the rendered leaderboard, cached by [`ResponseCacheMiddleware`] under
//!   the [`LEADERBOARD_KEY`] prefix for [`LEADERBOARD_TIMEOUT`].

pub mod middleware;

pub use middleware::ResponseCacheMiddleware;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::trace;

use crate::Response;
use crate::clock::{Clock, SystemClock};

/// TTL applied when `set` is called without one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const USER_POINTS_TIMEOUT: Duration = Duration::from_secs(300);
pub const LEADERBOARD_TIMEOUT: Duration = Duration::from_secs(600);

pub const LEADERBOARD_KEY: &str = "leaderboard";
pub const USER_POINTS_PREFIX: &str = "user_points:";

pub fn user_points_key(user_id: u64) -> String {
    format!("{USER_POINTS_PREFIX}{user_id}")
}

/// A key→value store with per-entry expiry.
pub trait Cache<V>: Send + Sync {
    /// Returns a live value for `key`.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` for `ttl`, or for the cache's default timeout when
    /// `ttl` is `None`.
    fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Removes `key`. Returns `true` if it was present.
    fn delete(&self, key: &str) -> bool;

    /// Removes every key starting with `prefix`. Returns how many were removed.
    fn delete_by_prefix(&self, prefix: &str) -> usize;
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// In-process [`Cache`] with lazy expiry.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    default_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl<V> MemoryCache<V> {
    pub fn new(default_timeout: Duration) -> Self {
        Self::with_clock(default_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(default_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_timeout,
            clock,
        }
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until they are read
    /// or purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(&self, ttl: Option<Duration>) -> DateTime<Utc> {
        let ttl = ttl.unwrap_or(self.default_timeout);
        let delta = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        self.clock
            .now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                trace!(key, "cache entry expired");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = self.expiry(ttl);
        self.lock()
            .insert(key.to_owned(), Entry { value, expires_at });
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }
}

/// Returns the cached value for `key`, computing and storing it with `f` on
/// a miss. Errors from `f` are returned and nothing is cached.
///
/// `f` runs outside the cache lock, so two concurrent misses may both
/// compute; the later write wins.
pub fn get_or_insert_with<V, E, C, F>(cache: &C, key: &str, ttl: Option<Duration>, f: F) -> Result<V, E>
where
    C: Cache<V> + ?Sized,
    V: Clone,
    F: FnOnce() -> Result<V, E>,
{
    if let Some(hit) = cache.get(key) {
        return Ok(hit);
    }
    let value = f()?;
    cache.set(key, value.clone(), ttl);
    Ok(value)
}

/// Forgets one user's memoized point total.
pub fn clear_user_points<V, C: Cache<V> + ?Sized>(cache: &C, user_id: u64) -> bool {
    cache.delete(&user_points_key(user_id))
}

/// Forgets every cached leaderboard response.
pub fn clear_leaderboard<V, C: Cache<V> + ?Sized>(cache: &C) -> usize {
    cache.delete_by_prefix(LEADERBOARD_KEY)
}

/// The two caches the points service keeps, shared by handlers and jobs.
#[derive(Clone)]
pub struct PointCaches {
    pub user_points: Arc<dyn Cache<i64>>,
    pub responses: Arc<dyn Cache<Response>>,
}

impl PointCaches {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT, clock)
    }

    pub fn with_timeout(default_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            user_points: Arc::new(MemoryCache::<i64>::with_clock(default_timeout, clock.clone())),
            responses: Arc::new(MemoryCache::<Response>::with_clock(default_timeout, clock)),
        }
    }

    /// Drops every memoized total and cached leaderboard. Returns how many
    /// entries went.
    pub fn invalidate_points(&self) -> usize {
        self.user_points.delete_by_prefix(USER_POINTS_PREFIX) + clear_leaderboard(self.responses.as_ref())
    }
}
