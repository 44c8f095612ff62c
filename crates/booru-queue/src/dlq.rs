//! DLQ and dead-queue utilities.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::streams::{StreamRangeReply, StreamReadReply};
use thiserror::Error;
use tracing::{debug, info, warn};

use booru_crypto::{envelope_payload, hmac_sign, sha256_hex, CryptoError, QueryCipher};
use booru_models::{DeadEntry, DlqEntry, FieldMapError, JobId, SearchRequest};

use crate::dedup::Deduplicator;
use crate::error::QueueError;
use crate::streams::{fields_to_map, stream_name, RequestStream, StreamKind};

/// Cap on the exponential re-enqueue delay.
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

/// Backoff applied when re-enqueueing the nth retry: `min(1000·2^n, 60000)`.
pub fn retry_backoff_ms(retry_count: u32) -> u64 {
    1000u64
        .saturating_mul(2u64.saturating_pow(retry_count))
        .min(MAX_RETRY_BACKOFF_MS)
}

/// How DLQ entries carry the query text.
///
/// `Encrypted` stores an AES-GCM payload alongside the hash and enables safe
/// retry. `HashOnly` stores only the hash; such entries can never be retried
/// and are promoted straight to dead. One mode per api, chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqPayloadMode {
    Encrypted,
    HashOnly,
}

pub type DlqResult<T> = Result<T, DlqError>;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Missing encryption key")]
    MissingEncryptionKey,

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,

    #[error("DLQ entry not found: {0}")]
    EntryNotFound(String),

    #[error("Encrypted query missing from DLQ entry")]
    EncryptedQueryMissing,

    #[error("Decryption failed: {0}")]
    DecryptionFailed(#[from] CryptoError),

    #[error("Query hash mismatch")]
    HashMismatch,

    #[error("Duplicate job detected during retry")]
    DuplicateOnRetry,

    #[error("Malformed DLQ entry: {0}")]
    Malformed(#[from] FieldMapError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// DLQ operations for one api.
#[derive(Clone)]
pub struct DeadLetterQueue {
    client: redis::Client,
    api_prefix: String,
    dlq_stream: String,
    dead_stream: String,
    group: String,
    mode: DlqPayloadMode,
    cipher: Option<QueryCipher>,
    hmac_secret: Option<Vec<u8>>,
}

impl DeadLetterQueue {
    pub fn new(
        client: redis::Client,
        api_prefix: impl Into<String>,
        mode: DlqPayloadMode,
        cipher: Option<QueryCipher>,
    ) -> Self {
        let api_prefix = api_prefix.into().to_lowercase();
        let dlq_stream = stream_name(&api_prefix, StreamKind::Dlq);
        let dead_stream = stream_name(&api_prefix, StreamKind::Dead);
        let group = format!("{}-dlq-group", api_prefix);
        Self {
            client,
            api_prefix,
            dlq_stream,
            dead_stream,
            group,
            mode,
            cipher,
            hmac_secret: None,
        }
    }

    /// Secret used to re-sign retried envelopes when producers authenticate.
    pub fn with_hmac_secret(mut self, secret: Option<Vec<u8>>) -> Self {
        self.hmac_secret = secret;
        self
    }

    pub fn mode(&self) -> DlqPayloadMode {
        self.mode
    }

    /// Create the DLQ consumer group if it does not exist yet.
    pub async fn init(&self) -> DlqResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.dlq_stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(stream = self.dlq_stream.as_str(), "Created DLQ consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = self.group.as_str(), "DLQ consumer group already exists");
            }
            Err(e) => return Err(DlqError::Redis(e)),
        }

        Ok(())
    }

    fn build_entry(
        &self,
        job_id: JobId,
        error: &str,
        query: &str,
        retry_count: u32,
    ) -> DlqResult<DlqEntry> {
        let encrypted_query = match self.mode {
            DlqPayloadMode::Encrypted => {
                let cipher = self.cipher.as_ref().ok_or(DlqError::MissingEncryptionKey)?;
                Some(cipher.encrypt(query)?)
            }
            DlqPayloadMode::HashOnly => None,
        };

        Ok(DlqEntry {
            job_id,
            error_message: error.to_string(),
            encrypted_query,
            query_hash: sha256_hex(query),
            retry_count,
            api_prefix: self.api_prefix.clone(),
            enqueued_at: Utc::now(),
            original_error: None,
            query_length: Some(query.chars().count()),
        })
    }

    async fn append(&self, stream: &str, fields: Vec<(String, String)>) -> DlqResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        Ok(cmd.query_async(&mut conn).await?)
    }

    /// Append a failed job to the DLQ. Returns the stream entry id.
    pub async fn add_to_dlq(
        &self,
        job_id: JobId,
        error: &str,
        query: &str,
        retry_count: u32,
    ) -> DlqResult<String> {
        let entry = self.build_entry(job_id, error, query, retry_count)?;
        let id = self.append(&self.dlq_stream, entry.to_fields()).await?;
        warn!(
            job_id = %entry.job_id,
            dlq_id = id.as_str(),
            retry_count = retry_count,
            "Job moved to DLQ"
        );
        Ok(id)
    }

    /// Append a permanently failed job directly to the dead queue.
    pub async fn move_to_dead_queue(
        &self,
        job_id: JobId,
        error: &str,
        query: &str,
        final_error: Option<&str>,
    ) -> DlqResult<String> {
        let entry = self.build_entry(job_id, error, query, 0)?;
        let dead = DeadEntry {
            entry,
            final_error: final_error.unwrap_or(error).to_string(),
            moved_at: Utc::now(),
        };
        let id = self.append(&self.dead_stream, dead.to_fields()).await?;
        warn!(job_id = %dead.entry.job_id, dead_id = id.as_str(), "Job moved to dead queue");
        Ok(id)
    }

    /// Promote an existing DLQ entry to the dead queue and delete the
    /// original. Works in both payload modes since the stored fields are
    /// reused as-is.
    pub async fn promote_entry(
        &self,
        stream_id: &str,
        entry: &DlqEntry,
        final_error: &str,
    ) -> DlqResult<String> {
        let dead = DeadEntry {
            entry: entry.clone(),
            final_error: final_error.to_string(),
            moved_at: Utc::now(),
        };
        let id = self.append(&self.dead_stream, dead.to_fields()).await?;
        self.delete(stream_id).await?;
        warn!(
            job_id = %entry.job_id,
            dead_id = id.as_str(),
            final_error = final_error,
            "DLQ entry promoted to dead queue"
        );
        Ok(id)
    }

    /// Fetch one DLQ entry by stream id.
    pub async fn fetch_entry(&self, stream_id: &str) -> DlqResult<Option<DlqEntry>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg(stream_id)
            .arg(stream_id)
            .query_async(&mut conn)
            .await?;

        match reply.ids.into_iter().next() {
            Some(entry) => {
                let fields = fields_to_map(&entry.map);
                Ok(Some(DlqEntry::from_fields(&fields)?))
            }
            None => Ok(None),
        }
    }

    /// Retry a DLQ entry back onto the request stream.
    ///
    /// Decrypts and integrity-checks the stored query, probes for duplicates,
    /// re-enqueues with an incremented retry count and capped exponential
    /// backoff, then deletes the original entry. Returns the new request
    /// stream entry id.
    pub async fn retry_from_dlq(
        &self,
        stream_id: &str,
        max_retries: u32,
        dedup_window: Duration,
        requests: &RequestStream,
        dedup: &Deduplicator,
    ) -> DlqResult<String> {
        let cipher = self.cipher.as_ref().ok_or(DlqError::MissingEncryptionKey)?;

        let entry = self
            .fetch_entry(stream_id)
            .await?
            .ok_or_else(|| DlqError::EntryNotFound(stream_id.to_string()))?;

        if entry.retry_count >= max_retries {
            return Err(DlqError::MaxRetriesExceeded);
        }

        let encrypted = entry
            .encrypted_query
            .as_deref()
            .ok_or(DlqError::EncryptedQueryMissing)?;
        let query = cipher.decrypt(encrypted)?;

        if sha256_hex(&query) != entry.query_hash {
            return Err(DlqError::HashMismatch);
        }

        if dedup
            .has_recent_query_hash(&self.api_prefix, &entry.query_hash, dedup_window, Some(stream_id))
            .await
        {
            return Err(DlqError::DuplicateOnRetry);
        }

        // Fresh envelope id: the original id's processed marker is still
        // armed from the first pass and would swallow the retry.
        let api_key = self
            .hmac_secret
            .as_deref()
            .map(|secret| hmac_sign(secret, &envelope_payload(&query, None)));
        let request = SearchRequest {
            job_id: JobId::new(),
            query,
            api_prefix: self.api_prefix.clone(),
            client_id: None,
            api_key,
            retry_count: entry.retry_count + 1,
            backoff_delay_ms: Some(retry_backoff_ms(entry.retry_count)),
        };
        let new_id = requests.enqueue(&request).await?;

        self.delete(stream_id).await?;

        info!(
            job_id = %entry.job_id,
            retry_count = entry.retry_count + 1,
            new_id = new_id.as_str(),
            "DLQ entry re-enqueued for retry"
        );
        Ok(new_id)
    }

    /// Read DLQ entries for the consumer group.
    pub async fn read(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> DlqResult<Vec<(String, HashMap<String, String>)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.dlq_stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::new();
        for stream_key in result.keys {
            for entry in stream_key.ids {
                entries.push((entry.id.clone(), fields_to_map(&entry.map)));
            }
        }
        Ok(entries)
    }

    /// Acknowledge a DLQ entry within the consumer group.
    pub async fn ack(&self, stream_id: &str) -> DlqResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("XACK")
            .arg(&self.dlq_stream)
            .arg(&self.group)
            .arg(stream_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete a DLQ entry from the stream.
    pub async fn delete(&self, stream_id: &str) -> DlqResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("XDEL")
            .arg(&self.dlq_stream)
            .arg(stream_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn queue(mode: DlqPayloadMode, cipher: Option<QueryCipher>) -> DeadLetterQueue {
        // Client::open only parses the URL, no connection is made.
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        DeadLetterQueue::new(client, "danbooru", mode, cipher)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff_ms(0), 1000);
        assert_eq!(retry_backoff_ms(1), 2000);
        assert_eq!(retry_backoff_ms(4), 16_000);
        assert_eq!(retry_backoff_ms(6), 60_000);
        assert_eq!(retry_backoff_ms(63), 60_000);
        assert_eq!(retry_backoff_ms(200), 60_000);
    }

    #[test]
    fn encrypted_entry_decrypts_back_to_hashed_query() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let dlq = queue(DlqPayloadMode::Encrypted, Some(cipher.clone()));

        let entry = dlq
            .build_entry(JobId::new(), "No posts found", "hatsune_miku 1girl", 2)
            .unwrap();

        let decrypted = cipher.decrypt(entry.encrypted_query.as_deref().unwrap()).unwrap();
        assert_eq!(decrypted, "hatsune_miku 1girl");
        assert_eq!(sha256_hex(&decrypted), entry.query_hash);
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.api_prefix, "danbooru");
        assert_eq!(entry.query_length, Some(18));
    }

    #[test]
    fn hash_only_entry_omits_payload() {
        let dlq = queue(DlqPayloadMode::HashOnly, None);
        let entry = dlq
            .build_entry(JobId::new(), "Rate limit", "secret query", 0)
            .unwrap();
        assert!(entry.encrypted_query.is_none());
        assert_eq!(entry.query_hash, sha256_hex("secret query"));
    }

    #[test]
    fn encrypted_mode_without_key_fails_loudly() {
        let dlq = queue(DlqPayloadMode::Encrypted, None);
        let err = dlq
            .build_entry(JobId::new(), "API error", "query", 0)
            .unwrap_err();
        assert!(matches!(err, DlqError::MissingEncryptionKey));
        assert_eq!(err.to_string(), "Missing encryption key");
    }
}
