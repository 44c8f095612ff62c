//! Error taxonomy surfaced on the response stream.

use serde::{Deserialize, Serialize};

/// Machine-readable error kind attached to error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Structural validation failed
    InvalidDto,
    /// Missing or wrong HMAC
    AuthFailed,
    /// Limiter rejected the request
    RateLimit,
    /// DLQ or job-level duplicate
    Duplicate,
    /// Upstream returned no posts (retryable via DLQ)
    UpstreamEmpty,
    /// Non-retryable upstream failure
    UpstreamError,
    /// Any unhandled failure
    Internal,
    /// Application-defined validation failure
    CustomError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidDto => "INVALID_DTO",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::UpstreamEmpty => "UPSTREAM_EMPTY",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::CustomError => "CUSTOM_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidDto).unwrap();
        assert_eq!(json, "\"INVALID_DTO\"");

        let decoded: ErrorCode = serde_json::from_str("\"RATE_LIMIT\"").unwrap();
        assert_eq!(decoded, ErrorCode::RateLimit);
    }
}
