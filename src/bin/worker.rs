//! Standalone dispatch worker.
//!
//! `start` runs the dispatch, retry and SLA loops until SIGINT; `run-once`
//! executes a single sweep of each loop and exits, for cron-style
//! deployments.

use anyhow::Result;
use clap::{Parser, Subcommand};
use payrail_backend::bootstrap::build_engine;
use payrail_backend::worker::{DispatchWorker, WorkerConfig};
use payrail_backend::Config;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "payrail-worker", about = "Payout dispatch worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loops until signalled.
    Start,
    /// Execute one sweep of each loop and exit.
    RunOnce,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payrail_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let engine = build_engine(Config::from_env()?)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Arc::new(DispatchWorker::new(
        Arc::clone(&engine.service),
        Arc::clone(&engine.connectors),
        Arc::clone(&engine.batches),
        WorkerConfig::from_env(),
        shutdown_rx,
    ));

    match cli.command {
        Command::Start => {
            let handle = tokio::spawn(Arc::clone(&worker).run());
            tokio::signal::ctrl_c().await?;
            info!("🛑 SIGINT received, draining worker");
            shutdown_tx.send(true).ok();
            handle.await??;
        }
        Command::RunOnce => {
            worker.run_once().await?;
            info!("run-once sweep complete");
        }
    }
    Ok(())
}
