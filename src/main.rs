use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use video_relay::config::CliArgs;
use video_relay::hub::StreamHub;
use video_relay::web::router;

/// Configuration isn't available until after `CliArgs::parse()` / `resolve()`
/// run, so the runtime can't be sized by the `#[tokio::main]` macro (it
/// expands before any of that executes). Build it by hand instead, so
/// `relay.worker-threads` actually governs the worker pool it documents.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let config = Arc::new(
        args.resolve()
            .context("failed to resolve relay configuration")?,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.relay.worker_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Arc<video_relay::config::Config>) -> Result<()> {
    let hub = StreamHub::new(Arc::clone(&config));
    hub.spawn_reaper();

    let addr = format!("0.0.0.0:{}", config.relay.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        address = %addr,
        worker_threads = config.relay.worker_threads,
        "video relay listening"
    );

    let app = router(Arc::clone(&hub));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("relay server error")?;

    Ok(())
}

/// Waits for Ctrl-C, then drains every Stream within the Hub's shutdown
/// budget before letting `axum::serve` return.
async fn shutdown_signal(hub: Arc<StreamHub>) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl-c handler, shutting down immediately");
        return;
    }
    tracing::info!("shutdown signal received, draining streams");
    hub.shutdown().await;
}
