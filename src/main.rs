use std::sync::Arc;

use anyhow::Result;
use tokio::signal;

use ara_task_queue::app::{start_queue, LoggingHandler};
use ara_task_queue::config::Settings;
use ara_task_queue::queue::MessageHandler;
use ara_task_queue::runtime::Runtime;
use ara_task_queue::shutdown::GracefulShutdown;
use ara_task_queue::telemetry::init_tracing;

/// Host name the service registers its queue under
const DEFAULT_HOST: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.log)?;
    tracing::info!(driver = %settings.queue.driver, "Configuration loaded");

    let runtime = Runtime::new();

    if settings.queue.streams.is_empty() {
        tracing::warn!("No streams configured, the queue will only accept messages");
    }
    let consumers: Vec<(String, Arc<dyn MessageHandler>)> = settings
        .queue
        .streams
        .iter()
        .map(|stream| (stream.clone(), Arc::new(LoggingHandler) as Arc<dyn MessageHandler>))
        .collect();

    // Start the queue, or keep running without it
    let queue = start_queue(&runtime, &settings.queue, DEFAULT_HOST, consumers).await;

    shutdown_signal().await;

    let result = GracefulShutdown::new(runtime.clone())
        .execute("signal received")
        .await;

    // Wait for the queue runner to finish
    if let Some(queue) = queue {
        if let Err(e) = queue.join().await {
            tracing::error!(error = %e, "Queue runner returned an error");
        }
    }

    if !result.success {
        tracing::warn!("Shutdown completed with errors");
    }
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
