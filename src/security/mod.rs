//! Request admission control.
//!
//! - [`RateLimiter`] — per-process sliding-window limiter keyed by client
//!   identity, with optional scoping per endpoint.
//! - [`RateLimitMiddleware`] — maps a rejected check to
//!   `429 Too Many Requests`.

pub mod middleware;
pub mod rate_limit;

pub use middleware::{RateLimitMiddleware, RateLimitStatus};
pub use rate_limit::{Decision, PolicyError, RateLimitPolicy, RateLimiter, ScopeFn};
