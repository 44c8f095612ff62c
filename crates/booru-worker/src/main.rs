//! Booru gateway worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use booru_worker::{DlqConsumer, ProcessingContext, WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive("booru_worker=info".parse().unwrap()))
        .init();

    info!("Starting booru-worker");

    let config = WorkerConfig::from_env();
    info!(apis = ?config.api_prefixes, mode = ?config.dlq_payload_mode, "Worker config loaded");

    let mut shutdown_senders = Vec::new();
    let mut handles = Vec::new();

    for api_prefix in &config.api_prefixes {
        let ctx = match ProcessingContext::new(config.clone(), api_prefix) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                error!(api = api_prefix.as_str(), error = %e, "Failed to build processing context");
                std::process::exit(1);
            }
        };

        let pool = WorkerPool::new(Arc::clone(&ctx));
        let shutdown = pool.shutdown_handle();
        shutdown_senders.push(shutdown.clone());

        let dlq_consumer = DlqConsumer::new(ctx);
        let dlq_shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = dlq_consumer.run(dlq_shutdown).await {
                error!(error = %e, "DLQ consumer error");
            }
        }));

        handles.push(tokio::spawn(async move {
            if let Err(e) = pool.run().await {
                error!(error = %e, "Worker pool error");
            }
        }));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    for sender in &shutdown_senders {
        let _ = sender.send(true);
    }

    for handle in handles {
        handle.await.ok();
    }

    info!("Worker shutdown complete");
}
