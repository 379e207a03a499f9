//! Worker-pool entry point for the `toolcore` executor.
//!
//! Parses CLI flags, layers the optional TOML file over them, initializes
//! logging, opens the database (running recovery before anything else is
//! dispatched), then spawns `workers` tasks that each loop
//! `Core::dispatch_one`, backing off briefly when the queue is empty so idle
//! workers don't spin. SIGINT or SIGTERM triggers a cancellation that lets
//! in-flight workers finish their current job before the process exits.

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use toolcore::config::{AppConfig, Cli};
use toolcore::core::Core;
use tracing::{info, warn};

const IDLE_BACKOFF_BASE_MS: u64 = 250;

/// Jittered idle backoff (±50% of the base) so that several idle workers
/// polling an empty queue don't all wake on the same tick.
fn idle_backoff() -> Duration {
    let jitter = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((IDLE_BACKOFF_BASE_MS as f64 * jitter) as u64)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_cli(cli)?;

    let log_level = if config.debug { "debug" } else { "info" };
    toolcore::logging::init_logging(log_level, config.log_to_file)?;

    info!(
        db_path = %config.db_path.display(),
        work_root = %config.work_root.display(),
        workers = config.workers,
        "starting toolcore"
    );

    let core = Core::new(&config).await?;
    core.recover().await?;

    let shutdown = CancellationToken::new();
    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let core = core.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, core, shutdown).await;
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, letting in-flight jobs finish");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("all workers stopped, exiting");
    Ok(())
}

async fn worker_loop(worker_id: usize, core: Core, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match core.dispatch_one().await {
            Ok(true) => continue,
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep(idle_backoff()) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(worker_id, error = %e, "worker loop error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(idle_backoff()) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM");
        }
    }
}
