//! Worker pool executor for one api's request stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::{process_message, ProcessingContext};

/// Messages pulled per read, bounded further by free permits.
const READ_BATCH: usize = 5;

/// Entries the claim scanner recovers per pass.
const CLAIM_BATCH: usize = 5;

/// Consumes the request stream and fans messages out to bounded tasks.
pub struct WorkerPool {
    ctx: Arc<ProcessingContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
}

impl WorkerPool {
    pub fn new(ctx: Arc<ProcessingContext>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            ctx,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    /// Run until shutdown: consume, dispatch, and periodically claim
    /// pending entries left by crashed workers.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            api = self.ctx.api_prefix.as_str(),
            consumer = self.consumer_name.as_str(),
            max_jobs = self.ctx.config.max_concurrent_jobs,
            "Starting worker pool"
        );

        self.ctx.requests.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();

        let claim_task = {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&self.job_semaphore);
            let consumer_name = self.consumer_name.clone();
            let mut shutdown_rx = self.shutdown.subscribe();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ctx.config.claim_interval);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = interval.tick() => {
                            let min_idle_ms = ctx.config.claim_min_idle.as_millis() as u64;
                            match ctx.requests.claim_pending(&consumer_name, min_idle_ms, CLAIM_BATCH).await {
                                Ok(entries) if !entries.is_empty() => {
                                    info!(count = entries.len(), "Claimed pending requests");
                                    for (message_id, fields) in entries {
                                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                            return;
                                        };
                                        let ctx = Arc::clone(&ctx);
                                        tokio::spawn(async move {
                                            let _permit = permit;
                                            Self::execute_message(ctx, message_id, fields).await;
                                        });
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "Failed to claim pending requests"),
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping worker pool");
                        break;
                    }
                }
                result = self.consume_batch() => {
                    if let Err(e) = result {
                        error!(error = %e, "Error consuming requests");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight messages to settle");
        let _ = tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_jobs()).await;

        info!("Worker pool stopped");
        Ok(())
    }

    async fn consume_batch(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let entries = self
            .ctx
            .requests
            .consume(
                &self.consumer_name,
                self.ctx.config.stream_block.as_millis() as u64,
                available.min(READ_BATCH),
            )
            .await?;

        if entries.is_empty() {
            return Ok(());
        }

        debug!(count = entries.len(), "Consumed requests");

        for (message_id, fields) in entries {
            let ctx = Arc::clone(&self.ctx);
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_message(ctx, message_id, fields).await;
            });
        }

        Ok(())
    }

    /// Process one entry; ack on success, leave pending on failure.
    async fn execute_message(
        ctx: Arc<ProcessingContext>,
        message_id: String,
        fields: std::collections::HashMap<String, String>,
    ) {
        match process_message(&ctx, &fields).await {
            Ok(()) => {
                if let Err(e) = ctx.requests.ack(&message_id).await {
                    error!(message_id = message_id.as_str(), error = %e, "Failed to ack request");
                }
            }
            Err(e) => {
                // Not acked on purpose: the claim scanner re-delivers it.
                error!(
                    message_id = message_id.as_str(),
                    error = %e,
                    "Message processing failed, entry stays pending"
                );
            }
        }
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.ctx.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown_handle(&self) -> tokio::sync::watch::Sender<bool> {
        self.shutdown.clone()
    }
}
