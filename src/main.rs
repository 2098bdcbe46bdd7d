//! Payrail API server.
//!
//! Boots the engine, optionally embeds the dispatch worker, and serves the
//! payout API until SIGINT.

use anyhow::{Context, Result};
use payrail_backend::api::{router, AppState};
use payrail_backend::bootstrap::build_engine;
use payrail_backend::worker::{DispatchWorker, WorkerConfig};
use payrail_backend::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payrail_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Payrail payout engine starting");

    let config = Config::from_env()?;
    let port = config.port;
    let embedded_worker = config.embedded_worker;
    let engine = build_engine(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = if embedded_worker {
        let worker = Arc::new(DispatchWorker::new(
            Arc::clone(&engine.service),
            Arc::clone(&engine.connectors),
            Arc::clone(&engine.batches),
            WorkerConfig::from_env(),
            shutdown_rx.clone(),
        ));
        Some(tokio::spawn(worker.run()))
    } else {
        info!("embedded worker disabled, dispatch left to payrail-worker");
        None
    };

    let state = AppState {
        service: Arc::clone(&engine.service),
        connectors: Arc::clone(&engine.connectors),
        batches: Arc::clone(&engine.batches),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Payout API listening on {}", addr);

    let server_shutdown = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(server_shutdown))
        .await
        .context("Server error")?;

    // Ctrl-C reached the server; drain the worker too.
    shutdown_tx.send(true).ok();
    if let Some(handle) = worker_handle {
        handle.await.ok();
    }

    info!("👋 Payrail shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 SIGINT received, shutting down");
        }
        _ = shutdown.changed() => {}
    }
}
