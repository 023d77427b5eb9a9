//! HTTP boundary for the rate limiter.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::rate_limit::{Decision, RateLimitPolicy, RateLimiter};
use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
};

/// Identity used when the connection's peer address is unknown.
const UNKNOWN_PEER: &str = "unknown";

/// Rate limiting middleware keyed by the client's IP address.
///
/// Allowed requests continue down the chain and have `X-RateLimit-Limit` and
/// `X-RateLimit-Remaining` added to their response. Rejected requests are
/// answered with `429 Too Many Requests` and a `Retry-After` header; the
/// downstream handler is **not** called.
///
/// Several middlewares can share one [`RateLimiter`]. Give them distinct
/// scopes so their windows stay separate.
///
/// # Examples
///
/// ```rust,no_run
/// use std::{sync::Arc, time::Duration};
/// use tally::security::{RateLimitMiddleware, RateLimitPolicy, RateLimiter};
///
/// let limiter = Arc::new(RateLimiter::new());
/// let policy = RateLimitPolicy::new(100, Duration::from_secs(60)).unwrap();
/// let middleware = RateLimitMiddleware::new(limiter, policy);
/// ```
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    path_prefix: Option<String>,
}

/// Outcome of the rate check for the current request, stored in the
/// request's extensions for handlers that want to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: usize,
    pub remaining: usize,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            policy,
            path_prefix: None,
        }
    }

    /// Limits only requests whose path starts with `prefix`; everything else
    /// passes through uncounted.
    #[must_use]
    pub fn only_under(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        if let Some(prefix) = &self.path_prefix {
            if !ctx.request().path().starts_with(prefix.as_str()) {
                return Box::pin(next.run(ctx));
            }
        }

        let identity = ctx
            .request()
            .remote_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_PEER.to_owned());
        let limit = self.policy.limit();
        let decision = self.limiter.check_and_record(&identity, &self.policy);

        Box::pin(async move {
            match decision {
                Decision::Allowed { remaining } => {
                    ctx.extensions_mut()
                        .insert(RateLimitStatus { limit, remaining });
                    let mut resp = next.run(ctx).await;
                    resp.add_header("X-RateLimit-Limit", limit.to_string());
                    resp.add_header("X-RateLimit-Remaining", remaining.to_string());
                    resp
                }
                Decision::Rejected { retry_after } => {
                    warn!(
                        peer = %identity,
                        path = %ctx.request().path(),
                        "too many requests"
                    );
                    too_many_requests(retry_after)
                }
            }
        })
    }
}

// `Retry-After` takes whole seconds; round up so clients never retry early.
fn too_many_requests(retry_after: Duration) -> Response {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    Response::new(StatusCode::TooManyRequests)
        .header("Retry-After", secs.max(1).to_string())
        .body("Too Many Requests")
}
