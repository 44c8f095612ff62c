//! DLQ and dead-queue entry models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{FieldMapError, JobId};

/// Entry on the `{api}-dlq` stream.
///
/// Invariant: when `encrypted_query` is present, it decrypts to a string
/// whose SHA-256 hex digest equals `query_hash`. In privacy (hash-only) mode
/// the encrypted payload is omitted and the entry can never be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub job_id: JobId,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_query: Option<String>,
    pub query_hash: String,
    pub retry_count: u32,
    pub api_prefix: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_length: Option<usize>,
}

impl DlqEntry {
    /// Flatten to XADD field/value pairs.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("jobId".to_string(), self.job_id.to_string()),
            ("error".to_string(), self.error_message.clone()),
            ("queryHash".to_string(), self.query_hash.clone()),
            ("retryCount".to_string(), self.retry_count.to_string()),
            ("apiPrefix".to_string(), self.api_prefix.clone()),
            ("enqueuedAt".to_string(), self.enqueued_at.to_rfc3339()),
        ];
        if let Some(encrypted) = &self.encrypted_query {
            fields.push(("encryptedQuery".to_string(), encrypted.clone()));
        }
        if let Some(original) = &self.original_error {
            fields.push(("originalError".to_string(), original.clone()));
        }
        if let Some(len) = self.query_length {
            fields.push(("queryLength".to_string(), len.to_string()));
        }
        fields
    }

    /// Parse a DLQ stream entry's field map.
    ///
    /// `jobId`, `error`, `queryHash` and `retryCount` are required; the rest
    /// degrade to defaults so old entries still parse.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, FieldMapError> {
        let job_id = fields
            .get("jobId")
            .ok_or(FieldMapError::MissingField("jobId"))?;
        let error_message = fields
            .get("error")
            .ok_or(FieldMapError::MissingField("error"))?;
        let query_hash = fields
            .get("queryHash")
            .ok_or(FieldMapError::MissingField("queryHash"))?;
        let retry_raw = fields
            .get("retryCount")
            .ok_or(FieldMapError::MissingField("retryCount"))?;
        let retry_count = retry_raw
            .parse()
            .map_err(|_| FieldMapError::InvalidField {
                field: "retryCount",
                value: retry_raw.clone(),
            })?;

        let enqueued_at = fields
            .get("enqueuedAt")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            job_id: JobId::from_string(job_id.clone()),
            error_message: error_message.clone(),
            encrypted_query: fields.get("encryptedQuery").cloned(),
            query_hash: query_hash.clone(),
            retry_count,
            api_prefix: fields.get("apiPrefix").cloned().unwrap_or_default(),
            enqueued_at,
            original_error: fields.get("originalError").cloned(),
            query_length: fields.get("queryLength").and_then(|raw| raw.parse().ok()),
        })
    }
}

/// Entry on the `{api}-dead` stream: a DLQ entry plus the terminal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadEntry {
    #[serde(flatten)]
    pub entry: DlqEntry,
    pub final_error: String,
    pub moved_at: DateTime<Utc>,
}

impl DeadEntry {
    /// Flatten to XADD field/value pairs.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = self.entry.to_fields();
        fields.push(("finalError".to_string(), self.final_error.clone()));
        fields.push(("movedAt".to_string(), self.moved_at.to_rfc3339()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> DlqEntry {
        DlqEntry {
            job_id: JobId::from_string("j-9"),
            error_message: "No posts found".to_string(),
            encrypted_query: Some("b64payload".to_string()),
            query_hash: "ab".repeat(32),
            retry_count: 1,
            api_prefix: "danbooru".to_string(),
            enqueued_at: Utc::now(),
            original_error: None,
            query_length: Some(18),
        }
    }

    #[test]
    fn dlq_field_roundtrip() {
        let entry = sample_entry();
        let fields: HashMap<String, String> = entry.to_fields().into_iter().collect();
        let parsed = DlqEntry::from_fields(&fields).expect("parse fields");

        assert_eq!(parsed.job_id, entry.job_id);
        assert_eq!(parsed.error_message, "No posts found");
        assert_eq!(parsed.encrypted_query.as_deref(), Some("b64payload"));
        assert_eq!(parsed.retry_count, 1);
        assert_eq!(parsed.query_length, Some(18));
    }

    #[test]
    fn missing_query_hash_is_rejected() {
        let mut fields: HashMap<String, String> =
            sample_entry().to_fields().into_iter().collect();
        fields.remove("queryHash");

        let err = DlqEntry::from_fields(&fields).unwrap_err();
        assert!(matches!(err, FieldMapError::MissingField("queryHash")));
    }

    #[test]
    fn dead_entry_adds_terminal_fields() {
        let dead = DeadEntry {
            entry: sample_entry(),
            final_error: "Max retries exceeded".to_string(),
            moved_at: Utc::now(),
        };
        let fields: HashMap<String, String> = dead.to_fields().into_iter().collect();
        assert_eq!(
            fields.get("finalError").map(String::as_str),
            Some("Max retries exceeded")
        );
        assert!(fields.contains_key("movedAt"));
    }
}
