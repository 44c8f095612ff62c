//! Deduplication primitives: processed markers, cross-job markers, and the
//! DLQ duplicate probe.

use std::time::Duration;

use chrono::Utc;
use redis::streams::StreamRangeReply;
use tracing::{debug, warn};

use booru_models::JobId;

use crate::error::QueueResult;
use crate::streams::{fields_to_map, stream_name, StreamKind};

/// Upper bound on entries scanned per probe.
const PROBE_SCAN_CAP: usize = 100;

/// Marker claiming a job id for processing: `processed:{jobId}`.
fn processed_key(job_id: &JobId) -> String {
    format!("processed:{}", job_id)
}

/// Cross-job marker set by DLQ logic: `dedup:job:{jobId}`.
fn dedup_job_key(job_id: &JobId) -> String {
    format!("dedup:job:{}", job_id)
}

/// Dedup operations against the shared datastore.
#[derive(Clone)]
pub struct Deduplicator {
    client: redis::Client,
}

impl Deduplicator {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Claim a job id for processing. Exactly one concurrent caller wins.
    pub async fn mark_processed(&self, job_id: &JobId, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(processed_key(job_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(claimed.is_some())
    }

    /// Worker-side probe: claim the cross-job marker for this job id and scan
    /// the api's DLQ window for an entry with the same query hash.
    ///
    /// Returns true when the request is a duplicate. Any datastore error
    /// returns false: the probe must never block legitimate processing.
    pub async fn is_duplicate(
        &self,
        api_prefix: &str,
        job_id: &JobId,
        query_hash: &str,
        window: Duration,
    ) -> bool {
        let marker = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let claimed: Option<String> = redis::cmd("SET")
                .arg(dedup_job_key(job_id))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(window.as_secs())
                .query_async(&mut conn)
                .await?;
            QueueResult::Ok(claimed.is_some())
        };

        match marker.await {
            Ok(false) => {
                debug!(job_id = %job_id, "Cross-job dedup marker already present");
                return true;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(api = api_prefix, error = %e, "Dedup marker claim failed, allowing request");
                return false;
            }
        }

        match self.scan_window(api_prefix, query_hash, window, None).await {
            Ok(duplicate) => duplicate,
            Err(e) => {
                warn!(api = api_prefix, error = %e, "DLQ dedup probe failed, allowing request");
                false
            }
        }
    }

    /// Scan-only probe: is this query hash already present in the api's DLQ
    /// window? Errors report false so the probe never blocks processing.
    ///
    /// Used where the cross-job marker must not be consulted: the
    /// validation-failure re-probe (this worker just claimed the marker
    /// itself) and the retry path (pass the entry under retry as
    /// `exclude_stream_id` so it does not match its own hash).
    pub async fn has_recent_query_hash(
        &self,
        api_prefix: &str,
        query_hash: &str,
        window: Duration,
        exclude_stream_id: Option<&str>,
    ) -> bool {
        match self
            .scan_window(api_prefix, query_hash, window, exclude_stream_id)
            .await
        {
            Ok(duplicate) => duplicate,
            Err(e) => {
                warn!(api = api_prefix, error = %e, "DLQ dedup probe failed, allowing request");
                false
            }
        }
    }

    async fn scan_window(
        &self,
        api_prefix: &str,
        query_hash: &str,
        window: Duration,
        exclude_stream_id: Option<&str>,
    ) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let window_start_ms = Utc::now().timestamp_millis() - window.as_millis() as i64;
        let start = format!("{}-0", window_start_ms.max(0));
        let stream = stream_name(api_prefix, StreamKind::Dlq);

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&stream)
            .arg(&start)
            .arg("+")
            .arg("COUNT")
            .arg(PROBE_SCAN_CAP)
            .query_async(&mut conn)
            .await?;

        for entry in reply.ids {
            if exclude_stream_id == Some(entry.id.as_str()) {
                continue;
            }
            let fields = fields_to_map(&entry.map);
            if fields.get("queryHash").map(String::as_str) == Some(query_hash) {
                debug!(
                    dlq_id = entry.id.as_str(),
                    "Query hash already present in DLQ window"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}
