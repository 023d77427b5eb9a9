//! Request routing — map URL patterns and HTTP methods to handler functions.
//!
//! | Pattern                | Example match          | Captured params        |
//! |------------------------|------------------------|------------------------|
//! | `/leaderboard`         | `/leaderboard`         | *(none)*               |
//! | `/users/:id/points`    | `/users/42/points`     | `id → "42"`            |
//! | `/static/*`            | `/static/app.css`      | `wildcard → "/app.css"` |
//!
//! Trailing slashes are ignored on both patterns and paths. Routes are tried
//! in registration order and the first match wins.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::{Method, Response, StatusCode};

/// Type-erased async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Blanket-implemented for every `Fn(Context) -> impl Future<Output = Response>`
/// so router methods can take `impl IntoHandler`.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

impl Pattern {
    /// Compiles a pattern string. `/*` suffix ⇒ wildcard, any `:` ⇒
    /// parameterized, otherwise exact.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();
            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                let mut params = PathParams::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                Some(params)
            }
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// Method + path router. Unmatched requests get `404 Not Found`.
///
/// # Examples
///
/// ```rust,no_run
/// use tally::{Router, Response, StatusCode, context::Context};
///
/// let mut router = Router::new();
/// router.get("/health", |_ctx| async { Response::new(StatusCode::Ok) });
/// router.get("/users/:id/points", |ctx: Context| async move {
///     let id = ctx.params().get("id").unwrap_or("unknown").to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Delete, path, handler);
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `ctx` to the first matching route, filling in its path
    /// parameters.
    pub async fn route(&self, mut ctx: Context) -> Response {
        let matched = self.routes.iter().find_map(|route| {
            if &route.method != ctx.request().method() {
                return None;
            }
            route
                .pattern
                .matches(ctx.request().path())
                .map(|params| (route, params))
        });

        match matched {
            Some((route, params)) => {
                ctx.set_params(params);
                (route.handler)(ctx).await
            }
            None => Response::new(StatusCode::NotFound),
        }
    }
}
