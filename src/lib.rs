//! # tally
//!
//! A classroom points service: a sliding-window rate limiter in front of a
//! small HTTP/1.1 API, and a task scheduler that keeps cached point totals
//! and periodic reports up to date.
//!
//! - [`security`]: per-client sliding-window rate limiting.
//! - [`background`]: scheduled tasks, run through a worker queue when one is
//!   reachable and inline otherwise.
//! - [`cache`]: TTL caches for point totals and rendered leaderboards.
//! - [`points`]: the ledger and the periodic jobs over it.
//! - [`app`]: wires it all into one [`middleware::Pipeline`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tally::{app::App, clock::SystemClock, config::AppConfig, points::MemoryLedger, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::build(AppConfig::default(), Arc::new(MemoryLedger::new()), Arc::new(SystemClock))?;
//!     let server = Server::bind(&app.config().bind).await?;
//!     server.run(app.pipeline().clone().into_handler()).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod background;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod points;
pub mod router;
pub mod security;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
