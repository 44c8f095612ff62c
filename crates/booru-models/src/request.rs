//! Job envelope read from the request stream.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a job.
///
/// Workers always mint a fresh server-side id when a message is read off the
/// wire; the producer-supplied id is kept only for correlation in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error parsing a stream entry's field map into a typed envelope.
#[derive(Debug, Error)]
pub enum FieldMapError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// An image-search job as it appears on the `{api}:requests` stream.
///
/// Immutable after enqueue. `retry_count`/`backoff_delay_ms` are only present
/// on entries re-enqueued from the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Producer-supplied job ID (untrusted, correlation only)
    pub job_id: JobId,
    /// Search query (tag expression)
    pub query: String,
    /// Upstream provider identifier, e.g. "danbooru"
    pub api_prefix: String,
    /// Optional client identifier used for per-client rate limiting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Optional HMAC-SHA-256 hex signature of the canonical payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// How many DLQ retries this job has already been through
    #[serde(default)]
    pub retry_count: u32,
    /// Delay the worker should apply before processing a retried job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_delay_ms: Option<u64>,
}

impl SearchRequest {
    /// Create a new request envelope.
    pub fn new(query: impl Into<String>, api_prefix: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            query: query.into(),
            api_prefix: api_prefix.into().to_lowercase(),
            client_id: None,
            api_key: None,
            retry_count: 0,
            backoff_delay_ms: None,
        }
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the HMAC signature.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the retry count (DLQ re-enqueue path).
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the backoff delay (DLQ re-enqueue path).
    pub fn with_backoff_delay_ms(mut self, delay_ms: u64) -> Self {
        self.backoff_delay_ms = Some(delay_ms);
        self
    }

    /// Flatten to XADD field/value pairs.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("jobId".to_string(), self.job_id.to_string()),
            ("query".to_string(), self.query.clone()),
            ("apiPrefix".to_string(), self.api_prefix.clone()),
        ];
        if let Some(client_id) = &self.client_id {
            fields.push(("clientId".to_string(), client_id.clone()));
        }
        if let Some(api_key) = &self.api_key {
            fields.push(("apiKey".to_string(), api_key.clone()));
        }
        if self.retry_count > 0 {
            fields.push(("retryCount".to_string(), self.retry_count.to_string()));
        }
        if let Some(delay) = self.backoff_delay_ms {
            fields.push(("backoffDelay".to_string(), delay.to_string()));
        }
        fields
    }

    /// Parse a stream entry's field map.
    ///
    /// `jobId` and `query` are required; `apiPrefix` falls back to the stream
    /// the entry was read from.
    pub fn from_fields(
        fields: &HashMap<String, String>,
        default_api_prefix: &str,
    ) -> Result<Self, FieldMapError> {
        let job_id = fields
            .get("jobId")
            .ok_or(FieldMapError::MissingField("jobId"))?;
        let query = fields
            .get("query")
            .ok_or(FieldMapError::MissingField("query"))?;

        let retry_count = match fields.get("retryCount") {
            Some(raw) => raw.parse().map_err(|_| FieldMapError::InvalidField {
                field: "retryCount",
                value: raw.clone(),
            })?,
            None => 0,
        };
        let backoff_delay_ms = match fields.get("backoffDelay") {
            Some(raw) => Some(raw.parse().map_err(|_| FieldMapError::InvalidField {
                field: "backoffDelay",
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            job_id: JobId::from_string(job_id.clone()),
            query: query.clone(),
            api_prefix: fields
                .get("apiPrefix")
                .cloned()
                .unwrap_or_else(|| default_api_prefix.to_string())
                .to_lowercase(),
            client_id: fields.get("clientId").cloned(),
            api_key: fields.get("apiKey").cloned(),
            retry_count,
            backoff_delay_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_field_roundtrip() {
        let request = SearchRequest::new("hatsune_miku 1girl", "Danbooru")
            .with_client_id("u1")
            .with_retry_count(2)
            .with_backoff_delay_ms(4000);

        let fields: HashMap<String, String> = request.to_fields().into_iter().collect();
        let parsed = SearchRequest::from_fields(&fields, "danbooru").expect("parse fields");

        assert_eq!(parsed.job_id, request.job_id);
        assert_eq!(parsed.query, "hatsune_miku 1girl");
        assert_eq!(parsed.api_prefix, "danbooru");
        assert_eq!(parsed.client_id.as_deref(), Some("u1"));
        assert_eq!(parsed.retry_count, 2);
        assert_eq!(parsed.backoff_delay_ms, Some(4000));
    }

    #[test]
    fn api_prefix_falls_back_to_stream() {
        let mut fields = HashMap::new();
        fields.insert("jobId".to_string(), "client-1".to_string());
        fields.insert("query".to_string(), "landscape".to_string());

        let parsed = SearchRequest::from_fields(&fields, "gelbooru").expect("parse fields");
        assert_eq!(parsed.api_prefix, "gelbooru");
        assert_eq!(parsed.retry_count, 0);
    }

    #[test]
    fn missing_query_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("jobId".to_string(), "client-1".to_string());

        let err = SearchRequest::from_fields(&fields, "danbooru").unwrap_err();
        assert!(matches!(err, FieldMapError::MissingField("query")));
    }

    #[test]
    fn bad_retry_count_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("jobId".to_string(), "client-1".to_string());
        fields.insert("query".to_string(), "landscape".to_string());
        fields.insert("retryCount".to_string(), "many".to_string());

        let err = SearchRequest::from_fields(&fields, "danbooru").unwrap_err();
        assert!(matches!(
            err,
            FieldMapError::InvalidField { field: "retryCount", .. }
        ));
    }
}
