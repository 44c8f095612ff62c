//! DLQ consumer: retries retryable failures, promotes the rest to the dead
//! queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use booru_models::DlqEntry;
use booru_queue::DlqError;

use crate::error::WorkerResult;
use crate::pipeline::ProcessingContext;

/// XREADGROUP block duration for DLQ reads.
const DLQ_BLOCK_MS: u64 = 5_000;

/// Entries pulled per cycle.
const DLQ_BATCH: usize = 10;

/// Pause after a clean cycle.
const SLEEP_AFTER_SUCCESS: Duration = Duration::from_secs(2);

/// Pause after a failed cycle.
const SLEEP_AFTER_ERROR: Duration = Duration::from_secs(5);

/// Error messages eligible for retry.
const RETRYABLE_MARKERS: [&str; 3] = ["No posts found", "Rate limit", "API error"];

/// Whether a DLQ error message is worth retrying.
pub fn is_retryable_error(message: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Long-running DLQ loop for one api.
pub struct DlqConsumer {
    ctx: Arc<ProcessingContext>,
    consumer_name: String,
}

impl DlqConsumer {
    pub fn new(ctx: Arc<ProcessingContext>) -> Self {
        Self {
            ctx,
            consumer_name: format!("dlq-{}", Uuid::new_v4()),
        }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> WorkerResult<()> {
        info!(
            api = self.ctx.api_prefix.as_str(),
            consumer = self.consumer_name.as_str(),
            "Starting DLQ consumer"
        );

        self.ctx.dlq.init().await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping DLQ consumer");
                        return Ok(());
                    }
                }
                result = self.cycle() => {
                    let pause = match result {
                        Ok(()) => SLEEP_AFTER_SUCCESS,
                        Err(e) => {
                            error!(error = %e, "DLQ cycle failed");
                            SLEEP_AFTER_ERROR
                        }
                    };
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn cycle(&self) -> WorkerResult<()> {
        let entries = self
            .ctx
            .dlq
            .read(&self.consumer_name, DLQ_BLOCK_MS, DLQ_BATCH)
            .await?;

        for (stream_id, fields) in entries {
            let entry = match DlqEntry::from_fields(&fields) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        stream_id = stream_id.as_str(),
                        error = %e,
                        "Dropping malformed DLQ entry"
                    );
                    self.ctx.dlq.delete(&stream_id).await?;
                    self.ctx.dlq.ack(&stream_id).await?;
                    continue;
                }
            };

            self.handle_entry(&stream_id, &entry).await?;
        }

        Ok(())
    }

    async fn handle_entry(&self, stream_id: &str, entry: &DlqEntry) -> WorkerResult<()> {
        let retryable =
            is_retryable_error(&entry.error_message) && entry.retry_count < self.ctx.config.max_dlq_retries;

        if !retryable {
            let final_error = entry
                .original_error
                .clone()
                .unwrap_or_else(|| "Max retries exceeded".to_string());
            self.ctx
                .dlq
                .promote_entry(stream_id, entry, &final_error)
                .await?;
            self.ctx.dlq.ack(stream_id).await?;
            return Ok(());
        }

        // Privacy mode stores no decryptable payload: retry is impossible.
        if entry.encrypted_query.is_none() {
            let final_error = format!(
                "Retry skipped due to privacy masking (attempt {})",
                entry.retry_count + 1
            );
            self.ctx
                .dlq
                .promote_entry(stream_id, entry, &final_error)
                .await?;
            self.ctx.dlq.ack(stream_id).await?;
            return Ok(());
        }

        match self
            .ctx
            .dlq
            .retry_from_dlq(
                stream_id,
                self.ctx.config.max_dlq_retries,
                self.ctx.config.dlq_dedup_window,
                &self.ctx.requests,
                &self.ctx.dedup,
            )
            .await
        {
            Ok(new_id) => {
                info!(
                    job_id = %entry.job_id,
                    new_id = new_id.as_str(),
                    "DLQ entry retried"
                );
                self.ctx.dlq.ack(stream_id).await?;
            }
            Err(
                e @ (DlqError::MaxRetriesExceeded
                | DlqError::EncryptedQueryMissing
                | DlqError::DecryptionFailed(_)
                | DlqError::HashMismatch
                | DlqError::DuplicateOnRetry),
            ) => {
                warn!(job_id = %entry.job_id, error = %e, "Retry rejected, promoting to dead queue");
                self.ctx
                    .dlq
                    .promote_entry(stream_id, entry, &e.to_string())
                    .await?;
                self.ctx.dlq.ack(stream_id).await?;
            }
            Err(DlqError::EntryNotFound(_)) => {
                // Raced with another consumer; nothing left to do.
                self.ctx.dlq.ack(stream_id).await?;
            }
            Err(e) => {
                // Transient failure: leave the entry pending for redelivery.
                warn!(job_id = %entry.job_id, error = %e, "Retry failed transiently");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error("No posts found for query"));
        assert!(is_retryable_error("Rate limit exceeded, try again later"));
        assert!(is_retryable_error("API error: status 503"));
        assert!(!is_retryable_error("INVALID_DTO:query must be 1-100 chars"));
        assert!(!is_retryable_error("Internal error: boom"));
    }
}
