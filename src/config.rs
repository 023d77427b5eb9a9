//! Service configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Environment variables prefixed `TALLY_` override whatever the file set.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::{PolicyError, RateLimitPolicy};

pub const ENV_PREFIX: &str = "TALLY_";

const MAX_BEAT_TICK_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// `limit` requests per `per_secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub limit: usize,
    pub per_secs: u64,
}

impl LimitConfig {
    pub fn policy(&self) -> Result<RateLimitPolicy, PolicyError> {
        RateLimitPolicy::new(self.limit, Duration::from_secs(self.per_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind: String,

    /// Applied to every request, per client address.
    pub rate_limit: LimitConfig,

    /// Applied on top of `rate_limit` to `/tasks` requests.
    pub task_rate_limit: LimitConfig,

    pub cache_timeout_secs: u64,
    pub user_points_timeout_secs: u64,
    pub leaderboard_timeout_secs: u64,

    /// Must not exceed a minute, or cron minutes can be skipped.
    pub beat_tick_ms: u64,

    /// Start the in-process task queue. When off, tasks run synchronously.
    pub task_queue: bool,
    pub workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            rate_limit: LimitConfig {
                limit: 100,
                per_secs: 60,
            },
            task_rate_limit: LimitConfig {
                limit: 5,
                per_secs: 60,
            },
            cache_timeout_secs: 300,
            user_points_timeout_secs: 300,
            leaderboard_timeout_secs: 600,
            beat_tick_ms: 30_000,
            task_queue: true,
            workers: 4,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Loads `path` if given (defaults otherwise), then applies the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `TALLY_*` overrides read through `lookup`.
    ///
    /// Recognised keys: `BIND`, `RATE_LIMIT`, `RATE_LIMIT_PER_SECS`,
    /// `TASK_RATE_LIMIT`, `TASK_RATE_LIMIT_PER_SECS`, `CACHE_TIMEOUT_SECS`,
    /// `USER_POINTS_TIMEOUT_SECS`, `LEADERBOARD_TIMEOUT_SECS`,
    /// `BEAT_TICK_MS`, `TASK_QUEUE`, `WORKERS`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("BIND") {
            self.bind = v;
        }
        if let Some(kv) = get("RATE_LIMIT") {
            self.rate_limit.limit = parse(kv)?;
        }
        if let Some(kv) = get("RATE_LIMIT_PER_SECS") {
            self.rate_limit.per_secs = parse(kv)?;
        }
        if let Some(kv) = get("TASK_RATE_LIMIT") {
            self.task_rate_limit.limit = parse(kv)?;
        }
        if let Some(kv) = get("TASK_RATE_LIMIT_PER_SECS") {
            self.task_rate_limit.per_secs = parse(kv)?;
        }
        if let Some(kv) = get("CACHE_TIMEOUT_SECS") {
            self.cache_timeout_secs = parse(kv)?;
        }
        if let Some(kv) = get("USER_POINTS_TIMEOUT_SECS") {
            self.user_points_timeout_secs = parse(kv)?;
        }
        if let Some(kv) = get("LEADERBOARD_TIMEOUT_SECS") {
            self.leaderboard_timeout_secs = parse(kv)?;
        }
        if let Some(kv) = get("BEAT_TICK_MS") {
            self.beat_tick_ms = parse(kv)?;
        }
        if let Some((key, value)) = get("TASK_QUEUE") {
            self.task_queue = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidValue { key, value }),
            };
        }
        if let Some(kv) = get("WORKERS") {
            self.workers = parse(kv)?;
        }
        Ok(self)
    }

    /// Checks the rate limits are usable and the beat is fine-grained
    /// enough for minute-resolution cron triggers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.policy()?;
        self.task_rate_limit.policy()?;
        if !(1..=MAX_BEAT_TICK_MS).contains(&self.beat_tick_ms) {
            return Err(ConfigError::InvalidValue {
                key: "beat_tick_ms".to_owned(),
                value: self.beat_tick_ms.to_string(),
            });
        }
        Ok(())
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    pub fn user_points_timeout(&self) -> Duration {
        Duration::from_secs(self.user_points_timeout_secs)
    }

    pub fn leaderboard_timeout(&self) -> Duration {
        Duration::from_secs(self.leaderboard_timeout_secs)
    }

    pub fn beat_tick(&self) -> Duration {
        Duration::from_millis(self.beat_tick_ms)
    }
}

fn parse<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
    let parsed = value.trim().parse().ok();
    parsed.ok_or(ConfigError::InvalidValue { key, value })
}
