//! # Task Worker
//!
//! Consumes task requests from RabbitMQ and answers them with the echo
//! handler.
//!
//! ## Usage
//!
//! ```bash
//! RABBITMQ_HOST=localhost RABBITMQ_PORT=5672 cargo run --bin task-worker
//!
//! # JSON logs, custom queue
//! LOG_FORMAT=json WORKER_QUEUE_NAME=rust_task RABBITMQ_HOST=rabbitmq RABBITMQ_PORT=5672 \
//!     cargo run --release --bin task-worker
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use scalable_worker::config::WorkerConfig;
use scalable_worker::handler::EchoTaskHandler;
use scalable_worker::logging;
use scalable_worker::messaging::providers::RabbitMqConnector;
use scalable_worker::worker::TaskWorker;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_structured_logging();

    // Configuration problems are fatal before any connection attempt
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("task-worker: invalid configuration: {e}");
            error!(error = %e, "Invalid configuration, exiting");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.broker.endpoint(),
        queue = %config.queue_name,
        "Starting task worker"
    );

    let connector = Arc::new(RabbitMqConnector::new(&config.broker, &config.connection_name));
    let handler = Arc::new(EchoTaskHandler::from_env());

    let mut worker = tokio::select! {
        result = TaskWorker::bootstrap(config, connector, handler) => match result {
            Ok(worker) => worker,
            Err(e) => {
                eprintln!("task-worker: {e}");
                error!(error = %e, "Failed to start task worker");
                std::process::exit(1);
            }
        },
        _ = shutdown_signal() => {
            info!("Shutdown requested before the worker connected");
            return Ok(());
        }
    };

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });

    info!("Worker running, press Ctrl+C to stop");
    worker.run().await;
    worker.close().await;
    info!("Task worker shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        },
        result = wait_for_sigterm() => match result {
            Ok(()) => info!("Received SIGTERM, initiating graceful shutdown"),
            Err(e) => warn!(error = %e, "Error setting up SIGTERM handler"),
        },
    }
}

/// Wait for SIGTERM signal (for container deployments)
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
