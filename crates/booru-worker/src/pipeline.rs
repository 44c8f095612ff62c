//! Per-message processing pipeline.
//!
//! Order per message: dedup → lock → validate → rate-limit → fetch →
//! publish → ack. Every terminal outcome publishes exactly one record on the
//! response stream; failures also land in the DLQ. Returning `Ok` tells the
//! executor to ack; an error leaves the entry pending for the claim scanner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::Client;
use tracing::{debug, error, warn};

use booru_cache::{CacheBackend, CacheLayer, CacheQuery, MemoryBackend, RedisBackend};
use booru_crypto::{sha256_hex, QueryCipher};
use booru_models::{ErrorCode, JobId, Post, SearchRequest, SearchResponse};
use booru_queue::{
    query_lock_key, DeadLetterQueue, Deduplicator, DlqPayloadMode, LockManager, RateLimiter,
    RequestStream, ResponsePublisher,
};
use booru_upstream::{BooruClient, UpstreamConfig};

use crate::config::{CacheBackendKind, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::validation::Validator;

/// Query lock acquisition retries before giving up.
const LOCK_RETRIES: u32 = 3;

/// Base delay between lock acquisition attempts.
const LOCK_RETRY_BASE: Duration = Duration::from_millis(100);

/// Cap on the delay honored from a re-enqueued entry.
const MAX_HONORED_BACKOFF: Duration = Duration::from_secs(60);

/// Everything one api's message processing needs, wired once at startup.
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub api_prefix: String,
    pub requests: RequestStream,
    pub publisher: ResponsePublisher,
    pub dedup: Deduplicator,
    pub locks: LockManager,
    pub limiter: RateLimiter,
    pub dlq: DeadLetterQueue,
    pub validator: Validator,
    pub upstream: BooruClient,
    pub cache: CacheLayer,
}

impl ProcessingContext {
    pub fn new(config: WorkerConfig, api_prefix: &str) -> WorkerResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;

        let cipher = config
            .encryption_key
            .as_deref()
            .map(QueryCipher::from_hex)
            .transpose()?;
        if config.dlq_payload_mode == DlqPayloadMode::Encrypted && cipher.is_none() {
            return Err(WorkerError::config_error(
                "ENCRYPTION_KEY is required in encrypted DLQ mode",
            ));
        }

        let backend: Arc<dyn CacheBackend> = match config.cache_backend {
            CacheBackendKind::Redis => Arc::new(RedisBackend::new(client.clone())),
            CacheBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        let cache = CacheLayer::new(backend, config.cache_ttl);

        let upstream_config = UpstreamConfig::new(
            api_prefix,
            config.upstream_base_url.clone(),
            config.upstream_login.clone(),
            config.upstream_api_key.clone(),
        )
        .with_timeout(config.api_timeout)
        .with_max_attempts(config.max_retry_attempts)
        .with_max_backoff(config.max_backoff);
        let upstream = BooruClient::new(upstream_config)?.with_cache(cache.clone());

        let api_prefix = api_prefix.to_lowercase();
        Ok(Self {
            requests: RequestStream::new(client.clone(), api_prefix.clone()),
            publisher: ResponsePublisher::new(client.clone()),
            dedup: Deduplicator::new(client.clone()),
            locks: LockManager::new(client.clone()),
            limiter: RateLimiter::new(client.clone()),
            dlq: DeadLetterQueue::new(client, api_prefix.clone(), config.dlq_payload_mode, cipher)
                .with_hmac_secret(config.hmac_secret.clone().map(String::into_bytes)),
            validator: Validator::new(config.hmac_secret.clone()),
            upstream,
            cache,
            api_prefix,
            config,
        })
    }
}

/// Publish an error record; failures are logged, never propagated.
async fn publish_error(ctx: &ProcessingContext, job_id: &JobId, message: &str, code: ErrorCode) {
    let response = SearchResponse::error(
        job_id.clone(),
        message,
        Some(code),
        Some(ctx.api_prefix.clone()),
    );
    if let Err(e) = ctx.publisher.publish(&ctx.api_prefix, response).await {
        warn!(job_id = %job_id, error = %e, "Failed to publish error response");
    }
}

/// Publish the error record and move the job to the DLQ.
///
/// A DLQ write failure propagates so the caller leaves the entry pending
/// instead of acking a job that was never parked anywhere.
async fn fail_to_dlq(
    ctx: &ProcessingContext,
    job_id: &JobId,
    request: &SearchRequest,
    message: &str,
    code: ErrorCode,
) -> WorkerResult<()> {
    publish_error(ctx, job_id, message, code).await;
    ctx.dlq
        .add_to_dlq(job_id.clone(), message, &request.query, request.retry_count)
        .await?;
    Ok(())
}

/// Process one request-stream entry. `Ok` means the caller should ack.
pub async fn process_message(
    ctx: &ProcessingContext,
    fields: &HashMap<String, String>,
) -> WorkerResult<()> {
    let request = match SearchRequest::from_fields(fields, &ctx.api_prefix) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Discarding malformed request entry");
            return Ok(());
        }
    };

    // Re-enqueued retries carry their own delay.
    if let Some(delay_ms) = request.backoff_delay_ms {
        let delay = Duration::from_millis(delay_ms).min(MAX_HONORED_BACKOFF);
        debug!(job_id = %request.job_id, delay_ms = delay.as_millis() as u64, "Honoring retry backoff");
        tokio::time::sleep(delay).await;
    }

    // Fresh server-side identity; the producer id is only the dedup handle.
    let job_id = JobId::new();
    let query_hash = sha256_hex(&request.query);

    if !ctx
        .dedup
        .mark_processed(&request.job_id, ctx.config.dedup_ttl)
        .await?
    {
        debug!(producer_job_id = %request.job_id, "Duplicate delivery, skipping");
        return Ok(());
    }

    // Downstream the envelope carries the server identity.
    let request = SearchRequest {
        job_id: job_id.clone(),
        ..request
    };

    if ctx
        .dedup
        .is_duplicate(&ctx.api_prefix, &job_id, &query_hash, ctx.config.dlq_dedup_window)
        .await
    {
        publish_error(ctx, &job_id, "Duplicate request detected", ErrorCode::Duplicate).await;
        return Ok(());
    }

    let lock_key = query_lock_key(&ctx.api_prefix, &query_hash);
    let token = ctx
        .locks
        .acquire_lock_with_retry(
            &lock_key,
            ctx.config.query_lock_timeout,
            LOCK_RETRIES,
            LOCK_RETRY_BASE,
        )
        .await?;
    let Some(token) = token else {
        publish_error(
            ctx,
            &job_id,
            "Query is currently being processed",
            ErrorCode::Duplicate,
        )
        .await;
        return Ok(());
    };

    let result = process_locked(ctx, &request, &job_id, &query_hash).await;

    if let Err(e) = ctx.locks.release_lock(&lock_key, &token).await {
        warn!(job_id = %job_id, error = %e, "Failed to release query lock, TTL will reap it");
    }

    result
}

/// Steps that run under the query lock, with the single outer recovery.
async fn process_locked(
    ctx: &ProcessingContext,
    request: &SearchRequest,
    job_id: &JobId,
    query_hash: &str,
) -> WorkerResult<()> {
    match run_guarded(ctx, request, job_id, query_hash).await {
        Ok(()) => Ok(()),
        // A DLQ write already failed; do not ack, let the claim scanner retry.
        Err(e @ WorkerError::Dlq(_)) => {
            error!(job_id = %job_id, error = %e, "DLQ write failed, leaving entry pending");
            Err(e)
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Unhandled processing failure");
            let message = format!("Internal error: {}", e);
            fail_to_dlq(ctx, job_id, request, &message, ErrorCode::Internal).await
        }
    }
}

async fn run_guarded(
    ctx: &ProcessingContext,
    request: &SearchRequest,
    job_id: &JobId,
    query_hash: &str,
) -> WorkerResult<()> {
    // Validation
    if let Err(validation_error) = ctx.validator.validate(request) {
        let message = validation_error.to_string();
        publish_error(ctx, job_id, &message, validation_error.code).await;

        // One more probe so a burst of identical invalid requests produces
        // a single DLQ entry.
        let duplicate = ctx
            .dedup
            .has_recent_query_hash(&ctx.api_prefix, query_hash, ctx.config.dlq_dedup_window, None)
            .await;
        if !duplicate {
            ctx.dlq
                .add_to_dlq(job_id.clone(), &message, &request.query, request.retry_count)
                .await?;
        }
        return Ok(());
    }

    // Rate limit
    let identifier = request.client_id.as_deref().unwrap_or("global");
    let allowed = ctx
        .limiter
        .check_rate_limit(
            identifier,
            &ctx.api_prefix,
            ctx.config.rate_limit_per_minute,
            ctx.config.rate_window,
        )
        .await?;
    if !allowed {
        publish_error(
            ctx,
            job_id,
            "Rate limit exceeded, try again later",
            ErrorCode::RateLimit,
        )
        .await;
        return Ok(());
    }

    // Upstream fetch through the seeded cache: identical queries within the
    // TTL get the same "random" answer.
    let cache_query = CacheQuery::new(&ctx.api_prefix, &request.query, true);
    let fetched: Result<Option<Post>, _> = ctx
        .cache
        .get_or_set(&cache_query, None, || {
            ctx.upstream.fetch_posts(&request.query, 1, true)
        })
        .await;

    match fetched {
        Ok(Some(post)) => match SearchResponse::success(job_id.clone(), &post) {
            Some(response) => {
                if let Err(e) = ctx.publisher.publish(&ctx.api_prefix, response).await {
                    warn!(job_id = %job_id, error = %e, "Failed to publish success response");
                }
                Ok(())
            }
            None => {
                fail_to_dlq(
                    ctx,
                    job_id,
                    request,
                    "No posts found for query",
                    ErrorCode::UpstreamEmpty,
                )
                .await
            }
        },
        Ok(None) => {
            fail_to_dlq(
                ctx,
                job_id,
                request,
                "No posts found for query",
                ErrorCode::UpstreamEmpty,
            )
            .await
        }
        Err(e) => {
            let message = format!("API error: {}", e);
            fail_to_dlq(ctx, job_id, request, &message, ErrorCode::UpstreamError).await
        }
    }
}
