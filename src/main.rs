//! tally server binary.
//!
//! Usage: `tally [config.json]`. `TALLY_*` environment variables override the
//! file; `RUST_LOG` controls logging (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tally::app::App;
use tally::clock::SystemClock;
use tally::config::AppConfig;
use tally::points::MemoryLedger;
use tally::server::Server;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logging();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;
    info!(bind = %config.bind, task_queue = config.task_queue, "config loaded");

    let app = App::build(config, Arc::new(MemoryLedger::new()), Arc::new(SystemClock))?;
    let server = Server::bind(&app.config().bind).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let beat = app.beat().spawn(stop_rx);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };
    server
        .run_until(app.pipeline().clone().into_handler(), shutdown)
        .await?;

    stop_tx.send(true).ok();
    if let Err(e) = beat.await {
        error!(error = %e, "beat task failed");
    }
    app.shutdown().await;
    info!("bye");
    Ok(())
}
