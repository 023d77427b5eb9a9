//! Middleware pipeline — composable before/after request handler logic.
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining chain; call [`Next::run`] to
//!   advance.
//! - [`Pipeline`] — an ordered stack of middleware in front of a [`Router`].
//! - [`LoggerMiddleware`] — request/response logger.
//!
//! Rate limiting lives in [`crate::security`] and response caching in
//! [`crate::cache`]; both plug in here.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, context::Context, router::Router};

/// A cursor into the remaining middleware chain for a single request.
///
/// Consumed by [`run`](Self::run), so each middleware can forward at most
/// once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain.
    ///
    /// An exhausted chain answers `500 Internal Server Error`.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit with
/// their own [`Response`], or decorate the downstream response. They must be
/// `Send + Sync` since one instance serves every connection task.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Logs each request's method, path, status, and duration once the
/// downstream handler completes.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request served"
            );
            response
        })
    }
}

/// Middleware stack terminated by a [`Router`].
///
/// Layers run in the order they were added; the first layer added sees the
/// request first.
///
/// # Examples
///
/// ```rust,no_run
/// use tally::{Router, middleware::{LoggerMiddleware, Pipeline}};
///
/// let pipeline = Pipeline::new(Router::new()).layer(LoggerMiddleware);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<[MiddlewareHandler]>,
}

impl Pipeline {
    pub fn new(router: Router) -> Self {
        let router = Arc::new(router);
        let terminal: MiddlewareHandler = Arc::new(
            move |ctx: Context, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
                let router = Arc::clone(&router);
                Box::pin(async move { router.route(ctx).await })
            },
        );
        Self {
            chain: Arc::from(vec![terminal]),
        }
    }

    /// Adds `middleware` in front of the router, after every layer added so
    /// far.
    #[must_use]
    pub fn layer<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        let mut chain: Vec<MiddlewareHandler> = self.chain.to_vec();
        let at = chain.len() - 1;
        chain.insert(at, from_middleware(Arc::new(middleware)));
        Self {
            chain: Arc::from(chain),
        }
    }

    /// Runs `request` through every layer and the router.
    pub async fn handle(&self, request: Request) -> Response {
        Next::new(Arc::clone(&self.chain)).run(Context::new(request)).await
    }

    /// The pipeline as a handler for [`crate::server::Server::run`].
    pub fn into_handler(
        self,
    ) -> impl Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static
    {
        move |request| {
            let pipeline = self.clone();
            Box::pin(async move { pipeline.handle(request).await })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let tag = self.0;
            Box::pin(async move {
                let mut resp = next.run(ctx).await;
                resp.add_header("X-Layer", tag);
                resp
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async { Response::new(StatusCode::TooManyRequests) })
        }
    }

    fn request(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn router() -> Router {
        let mut router = Router::new();
        router.get("/health", |_ctx| async { Response::new(StatusCode::Ok) });
        router
    }

    #[tokio::test]
    async fn layers_wrap_in_order() {
        let pipeline = Pipeline::new(router()).layer(Tag("outer")).layer(Tag("inner"));
        let resp = pipeline.handle(request("/health")).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        // Inner decorates first on the way out.
        let layers: Vec<_> = resp.headers().get_all("x-layer").collect();
        assert_eq!(layers, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_router() {
        let pipeline = Pipeline::new(router()).layer(LoggerMiddleware).layer(Deny);
        let resp = pipeline.handle(request("/health")).await;
        assert_eq!(resp.status(), StatusCode::TooManyRequests);
    }

    #[tokio::test]
    async fn exhausted_chain_is_500() {
        let resp = Next::new(Vec::<MiddlewareHandler>::new())
            .run(Context::new(request("/")))
            .await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);
    }
}
