//! Response caching middleware.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::Cache;
use crate::{
    Method, Response,
    context::Context,
    middleware::{Middleware, Next},
};

/// Caches successful `GET` responses for a fixed TTL.
///
/// Entries are keyed `prefix:path` (plus `?query` when present), so
/// `delete_by_prefix(prefix)` invalidates every cached variant at once.
/// Responses served from the cache carry `X-Cache: hit`, fresh ones
/// `X-Cache: miss`. Other methods and non-2xx responses bypass the cache.
pub struct ResponseCacheMiddleware {
    cache: Arc<dyn Cache<Response>>,
    prefix: String,
    ttl: Duration,
    path_prefix: Option<String>,
}

impl ResponseCacheMiddleware {
    pub fn new(cache: Arc<dyn Cache<Response>>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            ttl,
            path_prefix: None,
        }
    }

    /// Caches only requests whose path starts with `path`.
    #[must_use]
    pub fn only_under(mut self, path: impl Into<String>) -> Self {
        self.path_prefix = Some(path.into());
        self
    }

    fn key_for(&self, ctx: &Context) -> String {
        let request = ctx.request();
        match request.query_string() {
            Some(query) => format!("{}:{}?{}", self.prefix, request.path(), query),
            None => format!("{}:{}", self.prefix, request.path()),
        }
    }
}

impl Middleware for ResponseCacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let applies = ctx.request().method() == &Method::Get
            && self
                .path_prefix
                .as_deref()
                .is_none_or(|p| ctx.request().path().starts_with(p));
        if !applies {
            return Box::pin(next.run(ctx));
        }

        let key = self.key_for(&ctx);
        if let Some(mut hit) = self.cache.get(&key) {
            debug!(%key, "response cache hit");
            hit.add_header("X-Cache", "hit");
            return Box::pin(async move { hit });
        }

        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;
        Box::pin(async move {
            let mut resp = next.run(ctx).await;
            if resp.status().is_success() {
                cache.set(&key, resp.clone(), Some(ttl));
            }
            resp.add_header("X-Cache", "miss");
            resp
        })
    }
}
