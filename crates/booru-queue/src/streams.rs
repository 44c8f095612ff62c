//! Stream naming, the request stream, and the response publisher.

use std::collections::HashMap;

use chrono::Utc;
use redis::streams::{StreamPendingReply, StreamReadReply};
use tracing::{debug, info, warn};

use booru_models::{SearchRequest, SearchResponse};

use crate::error::{QueueError, QueueResult};

/// Kinds of streams the gateway touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Requests,
    Responses,
    Dlq,
    Dead,
}

/// Canonical stream name for an api and kind.
///
/// Request/response streams are colon-separated, DLQ/dead are dash-separated.
/// The discrepancy is on-the-wire compatibility and is preserved here, in one
/// place, on purpose.
pub fn stream_name(api_prefix: &str, kind: StreamKind) -> String {
    let api = api_prefix.to_lowercase();
    match kind {
        StreamKind::Requests => format!("{}:requests", api),
        StreamKind::Responses => format!("{}:responses", api),
        StreamKind::Dlq => format!("{}-dlq", api),
        StreamKind::Dead => format!("{}-dead", api),
    }
}

/// Consumer group name for an api's request stream.
pub fn group_name(api_prefix: &str) -> String {
    format!("{}-group", api_prefix.to_lowercase())
}

/// Convert a stream entry's value map into owned strings.
pub(crate) fn fields_to_map(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    let mut fields = HashMap::with_capacity(map.len());
    for (key, value) in map {
        match value {
            redis::Value::BulkString(bytes) => {
                fields.insert(key.clone(), String::from_utf8_lossy(bytes).into_owned());
            }
            redis::Value::SimpleString(s) => {
                fields.insert(key.clone(), s.clone());
            }
            redis::Value::Int(n) => {
                fields.insert(key.clone(), n.to_string());
            }
            _ => {}
        }
    }
    fields
}

/// The `{api}:requests` stream bound to its consumer group.
#[derive(Clone)]
pub struct RequestStream {
    client: redis::Client,
    api_prefix: String,
    stream: String,
    group: String,
}

impl RequestStream {
    pub fn new(client: redis::Client, api_prefix: impl Into<String>) -> Self {
        let api_prefix = api_prefix.into().to_lowercase();
        let stream = stream_name(&api_prefix, StreamKind::Requests);
        let group = group_name(&api_prefix);
        Self {
            client,
            api_prefix,
            stream,
            group,
        }
    }

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(stream = self.stream.as_str(), group = self.group.as_str(), "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = self.group.as_str(), "Consumer group already exists");
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Append a request envelope. Returns the stream entry id.
    pub async fn enqueue(&self, request: &SearchRequest) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream).arg("*");
        for (field, value) in request.to_fields() {
            cmd.arg(field).arg(value);
        }

        let message_id: String = cmd.query_async(&mut conn).await?;
        debug!(
            job_id = %request.job_id,
            message_id = message_id.as_str(),
            "Enqueued request"
        );
        Ok(message_id)
    }

    /// Read new entries for this consumer, blocking up to `block_ms`.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, HashMap<String, String>)>> {
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
            .arg(&self.stream)
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

    /// Acknowledge an entry and remove it from the stream.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.stream)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(message_id = message_id, "Acknowledged request");
        Ok(())
    }

    /// Claim pending entries idle longer than `min_idle_ms`.
    ///
    /// Recovers entries left pending by crashed workers.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, HashMap<String, String>)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let pending_count: usize = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut conn)
            .await
            .map(|reply: StreamPendingReply| reply.count())
            .unwrap_or(0);

        if pending_count == 0 {
            return Ok(Vec::new());
        }

        let pending_details: Vec<Vec<redis::Value>> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Entry format: [id, consumer, idle_time_ms, delivery_count]
        let mut to_claim = Vec::new();
        for detail in pending_details {
            if let (Some(redis::Value::BulkString(id_bytes)), Some(redis::Value::Int(idle_ms))) =
                (detail.first(), detail.get(2))
            {
                if *idle_ms as u64 >= min_idle_ms {
                    if let Ok(id) = String::from_utf8(id_bytes.clone()) {
                        to_claim.push(id);
                    }
                }
            }
        }

        if to_claim.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream)
            .arg(&self.group)
            .arg(consumer_name)
            .arg(min_idle_ms);
        for id in &to_claim {
            cmd.arg(id);
        }

        let claimed: Vec<Vec<redis::Value>> = cmd.query_async(&mut conn).await?;

        let mut entries = Vec::new();
        for message in claimed {
            let (Some(redis::Value::BulkString(id_bytes)), Some(redis::Value::Array(raw_fields))) =
                (message.first(), message.get(1))
            else {
                continue;
            };
            let Ok(message_id) = String::from_utf8(id_bytes.clone()) else {
                continue;
            };

            let mut fields = HashMap::new();
            let mut i = 0;
            while i + 1 < raw_fields.len() {
                if let (
                    Some(redis::Value::BulkString(field)),
                    Some(redis::Value::BulkString(value)),
                ) = (raw_fields.get(i), raw_fields.get(i + 1))
                {
                    fields.insert(
                        String::from_utf8_lossy(field).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
                i += 2;
            }

            info!(message_id = message_id.as_str(), "Claimed pending request");
            entries.push((message_id, fields));
        }

        Ok(entries)
    }
}

/// Publishes terminal records to `{api}:responses`.
#[derive(Clone)]
pub struct ResponsePublisher {
    client: redis::Client,
}

impl ResponsePublisher {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Stamp the envelope and append it. Returns the stream entry id.
    pub async fn publish(
        &self,
        api_prefix: &str,
        response: SearchResponse,
    ) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let stamped = response.stamped(Utc::now());
        let payload = serde_json::to_string(&stamped)?;
        let stream = stream_name(api_prefix, StreamKind::Responses);

        let message_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("jobId")
            .arg(stamped.job_id().as_str())
            .arg("data")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        if stamped.is_success() {
            debug!(job_id = %stamped.job_id(), "Published success response");
        } else {
            warn!(job_id = %stamped.job_id(), "Published error response");
        }

        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_preserves_wire_discrepancy() {
        assert_eq!(stream_name("danbooru", StreamKind::Requests), "danbooru:requests");
        assert_eq!(stream_name("danbooru", StreamKind::Responses), "danbooru:responses");
        assert_eq!(stream_name("danbooru", StreamKind::Dlq), "danbooru-dlq");
        assert_eq!(stream_name("danbooru", StreamKind::Dead), "danbooru-dead");
    }

    #[test]
    fn stream_name_lowercases_api_prefix() {
        assert_eq!(stream_name("Danbooru", StreamKind::Requests), "danbooru:requests");
        assert_eq!(group_name("Danbooru"), "danbooru-group");
    }

    #[test]
    fn fields_to_map_converts_bulk_and_simple_strings() {
        let mut raw = HashMap::new();
        raw.insert(
            "query".to_string(),
            redis::Value::BulkString(b"hatsune_miku".to_vec()),
        );
        raw.insert(
            "status".to_string(),
            redis::Value::SimpleString("ok".to_string()),
        );
        raw.insert("retryCount".to_string(), redis::Value::Int(2));
        raw.insert("ignored".to_string(), redis::Value::Nil);

        let fields = fields_to_map(&raw);
        assert_eq!(fields.get("query").map(String::as_str), Some("hatsune_miku"));
        assert_eq!(fields.get("status").map(String::as_str), Some("ok"));
        assert_eq!(fields.get("retryCount").map(String::as_str), Some("2"));
        assert!(!fields.contains_key("ignored"));
    }
}
