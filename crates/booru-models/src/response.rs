//! Response envelope published to the `{api}:responses` stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_code::ErrorCode;
use crate::post::{Post, Rating};
use crate::request::JobId;

/// Successful search outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub job_id: JobId,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub rating: Rating,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub copyright: Vec<String>,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<String>>,
    /// Stamped by the publisher, never by the worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Failed search outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub job_id: JobId,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Terminal record for a job, exactly one per accepted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchResponse {
    Success(SuccessResponse),
    Error(ErrorResponse),
}

impl SearchResponse {
    /// Build a success envelope from a sanitized upstream post.
    pub fn success(job_id: JobId, post: &Post) -> Option<Self> {
        let image_url = post.image_url()?.to_string();
        let characters = match Post::split_tags(post.tag_string_character.as_deref()) {
            chars if chars.is_empty() => None,
            chars => Some(chars),
        };

        Some(SearchResponse::Success(SuccessResponse {
            job_id,
            image_url,
            author: post.tag_string_artist.clone().filter(|a| !a.is_empty()),
            tags: Post::split_tags(post.tag_string_general.as_deref()),
            rating: post
                .rating
                .as_deref()
                .and_then(Rating::parse)
                .unwrap_or_default(),
            source: post.source.clone().filter(|s| !s.is_empty()),
            copyright: Post::split_tags(post.tag_string_copyright.as_deref()),
            id: post.id,
            characters,
            timestamp: None,
        }))
    }

    /// Build an error envelope.
    pub fn error(
        job_id: JobId,
        error: impl Into<String>,
        code: Option<ErrorCode>,
        api_prefix: Option<String>,
    ) -> Self {
        SearchResponse::Error(ErrorResponse {
            job_id,
            error: error.into(),
            code,
            api_prefix,
            timestamp: None,
        })
    }

    /// Job this response belongs to.
    pub fn job_id(&self) -> &JobId {
        match self {
            SearchResponse::Success(r) => &r.job_id,
            SearchResponse::Error(r) => &r.job_id,
        }
    }

    /// Stamp the publish timestamp.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            SearchResponse::Success(r) => r.timestamp = Some(at),
            SearchResponse::Error(r) => r.timestamp = Some(at),
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SearchResponse::Success(_))
    }
}
