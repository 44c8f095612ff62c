//! Structural validation and HMAC authentication of job envelopes.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use booru_crypto::{envelope_payload, hmac_verify};
use booru_models::{ErrorCode, SearchRequest};

/// Query alphabet: word chars, whitespace, and a small punctuation set.
static QUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[\w\s\-,:()]{1,100}$").unwrap());

static CLIENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,50}$").unwrap());

/// Maximum accepted api key length.
const MAX_API_KEY_LEN: usize = 100;

/// A rejected envelope: machine code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: ErrorCode,
    pub message: String,
}

impl ValidationError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidDto,
            message: message.into(),
        }
    }

    fn auth(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AuthFailed,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.code, self.message)
    }
}

/// Envelope validator; HMAC authentication is enforced iff a secret is
/// configured.
#[derive(Clone, Default)]
pub struct Validator {
    hmac_secret: Option<Vec<u8>>,
}

impl Validator {
    pub fn new(hmac_secret: Option<String>) -> Self {
        Self {
            hmac_secret: hmac_secret.map(String::into_bytes),
        }
    }

    /// Canonical payload producers sign over this envelope.
    pub fn canonical_payload(request: &SearchRequest) -> String {
        envelope_payload(&request.query, request.client_id.as_deref())
    }

    /// Validate structure, then authenticate when configured.
    pub fn validate(&self, request: &SearchRequest) -> Result<(), ValidationError> {
        if Uuid::parse_str(request.job_id.as_str()).is_err() {
            return Err(ValidationError::invalid("jobId is not a valid UUID"));
        }

        if !QUERY_RE.is_match(&request.query) {
            return Err(ValidationError::invalid(
                "query must be 1-100 chars of letters, digits, whitespace, or -,:()",
            ));
        }

        if let Some(client_id) = &request.client_id {
            if !CLIENT_ID_RE.is_match(client_id) {
                return Err(ValidationError::invalid(
                    "clientId must be 1-50 alphanumeric or underscore chars",
                ));
            }
        }

        if let Some(api_key) = &request.api_key {
            if api_key.len() > MAX_API_KEY_LEN {
                return Err(ValidationError::invalid("apiKey exceeds 100 chars"));
            }
        }

        if let Some(secret) = &self.hmac_secret {
            let Some(api_key) = &request.api_key else {
                return Err(ValidationError::auth("Missing API key"));
            };
            let payload = Self::canonical_payload(request);
            if !hmac_verify(secret, &payload, api_key) {
                return Err(ValidationError::auth("Invalid authentication"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booru_crypto::hmac_sign;
    use booru_models::JobId;

    fn request(query: &str) -> SearchRequest {
        let mut request = SearchRequest::new(query, "danbooru");
        request.job_id = JobId::new();
        request
    }

    #[test]
    fn accepts_well_formed_request() {
        let validator = Validator::new(None);
        let req = request("hatsune_miku 1girl").with_client_id("u1");
        assert!(validator.validate(&req).is_ok());
    }

    #[test]
    fn rejects_non_uuid_job_id() {
        let validator = Validator::new(None);
        let mut req = request("query");
        req.job_id = JobId::from_string("client-1");
        let err = validator.validate(&req).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDto);
    }

    #[test]
    fn rejects_bad_query_alphabet() {
        let validator = Validator::new(None);
        let err = validator.validate(&request("<script>")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDto);
    }

    #[test]
    fn rejects_overlong_query() {
        let validator = Validator::new(None);
        let err = validator.validate(&request(&"a".repeat(101))).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDto);
    }

    #[test]
    fn accepts_query_with_allowed_punctuation() {
        let validator = Validator::new(None);
        assert!(validator.validate(&request("rating:safe (solo, 1girl)")).is_ok());
    }

    #[test]
    fn rejects_bad_client_id() {
        let validator = Validator::new(None);
        let req = request("query").with_client_id("has space");
        let err = validator.validate(&req).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDto);
    }

    #[test]
    fn auth_requires_api_key_when_configured() {
        let validator = Validator::new(Some("secret".to_string()));
        let err = validator.validate(&request("query")).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthFailed);
        assert_eq!(err.message, "Missing API key");
        assert_eq!(err.to_string(), "AUTH_FAILED:Missing API key");
    }

    #[test]
    fn auth_accepts_valid_signature() {
        let validator = Validator::new(Some("secret".to_string()));
        let mut req = request("hatsune_miku").with_client_id("u1");
        let payload = Validator::canonical_payload(&req);
        req.api_key = Some(hmac_sign(b"secret", &payload));
        assert!(validator.validate(&req).is_ok());
    }

    #[test]
    fn auth_rejects_wrong_signature() {
        let validator = Validator::new(Some("secret".to_string()));
        let mut req = request("hatsune_miku");
        req.api_key = Some(hmac_sign(b"other-secret", &Validator::canonical_payload(&req)));
        let err = validator.validate(&req).unwrap_err();
        assert_eq!(err.message, "Invalid authentication");
    }

    #[test]
    fn no_auth_required_without_secret() {
        let validator = Validator::new(None);
        let req = request("query").with_api_key("anything-goes");
        assert!(validator.validate(&req).is_ok());
    }
}
