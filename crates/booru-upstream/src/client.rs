//! HTTP client for the upstream posts API.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use booru_cache::{CacheLayer, CacheQuery};
use booru_models::Post;

use crate::error::{UpstreamError, UpstreamResult};
use crate::sanitize::sanitize_post;

/// Jitter added on top of exponential retry delays.
const JITTER_MS: u64 = 250;

/// Base delay for exponential backoff between attempts.
const BASE_BACKOFF_MS: u64 = 500;

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Provider identifier, e.g. "danbooru"; keys the cache tuple
    pub api_prefix: String,
    /// Base URL, e.g. "https://danbooru.donmai.us"
    pub base_url: String,
    /// Basic auth login
    pub login: String,
    /// Basic auth API key
    pub api_key: String,
    /// Hard per-request timeout
    pub timeout: Duration,
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Cap on the exponential retry delay
    pub max_backoff: Duration,
}

impl UpstreamConfig {
    pub fn new(
        api_prefix: impl Into<String>,
        base_url: impl Into<String>,
        login: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            api_prefix: api_prefix.into().to_lowercase(),
            base_url: base_url.into(),
            login: login.into(),
            api_key: api_key.into(),
            timeout: Duration::from_millis(10_000),
            max_attempts: 3,
            max_backoff: Duration::from_millis(30_000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    data: Vec<Post>,
}

/// Client for one upstream provider.
#[derive(Clone)]
pub struct BooruClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    cache: Option<CacheLayer>,
}

impl BooruClient {
    pub fn new(config: UpstreamConfig) -> UpstreamResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(UpstreamError::config("base URL must not be empty"));
        }
        if config.login.trim().is_empty() || config.api_key.trim().is_empty() {
            return Err(UpstreamError::config("upstream credentials must not be empty"));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            config,
            cache: None,
        })
    }

    /// Attach a cache consulted for non-random queries.
    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fetch the first matching post.
    ///
    /// Returns `Ok(None)` when the upstream has no posts for the query.
    /// Non-random fetches go through the cache: hit short-circuits, success
    /// writes through.
    pub async fn fetch_posts(
        &self,
        query: &str,
        limit: u32,
        random: bool,
    ) -> UpstreamResult<Option<Post>> {
        if !random {
            if let Some(cache) = &self.cache {
                let cache_query = CacheQuery::new(&self.config.api_prefix, query, false)
                    .with_limit(limit);
                return cache
                    .get_or_set(&cache_query, None, || self.fetch_remote(query, limit, random))
                    .await;
            }
        }
        self.fetch_remote(query, limit, random).await
    }

    async fn fetch_remote(
        &self,
        query: &str,
        limit: u32,
        random: bool,
    ) -> UpstreamResult<Option<Post>> {
        let mut url = format!(
            "{}/posts.json?tags={}&limit={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(query),
            limit
        );
        if random {
            url.push_str("&random=true");
        }

        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            let result = self
                .http
                .get(&url)
                .basic_auth(&self.config.login, Some(&self.config.api_key))
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_error = e.to_string();
                    warn!(attempt = attempt, error = %e, "Upstream request failed, will retry");
                    self.backoff(attempt, None).await;
                    continue;
                }
                Err(e) => return Err(UpstreamError::Http(e)),
            };

            let status = response.status();
            if status.is_success() {
                let body: PostsResponse = response.json().await?;
                let Some(mut post) = body.data.into_iter().next() else {
                    debug!(query_len = query.len(), "Upstream returned no posts");
                    return Ok(None);
                };
                sanitize_post(&mut post);
                return Ok(Some(post));
            }

            if status.as_u16() == 429 || status.is_server_error() {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);

                last_error = format!("status {}", status.as_u16());
                warn!(
                    attempt = attempt,
                    status = status.as_u16(),
                    "Upstream throttled or erroring, will retry"
                );
                self.backoff(attempt, retry_after).await;
                continue;
            }

            // Non-retryable status
            return Err(UpstreamError::Status(status.as_u16()));
        }

        Err(UpstreamError::RetriesExhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }

    /// Sleep before the next attempt: `Retry-After` when the server sent one,
    /// capped exponential backoff with jitter otherwise.
    async fn backoff(&self, attempt: u32, retry_after: Option<Duration>) {
        let delay = match retry_after {
            Some(delay) => delay.min(self.config.max_backoff),
            None => {
                let exp = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt - 1));
                let jitter = rand::random::<u64>() % JITTER_MS;
                Duration::from_millis(exp + jitter).min(self.config.max_backoff)
            }
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> UpstreamConfig {
        UpstreamConfig::new("danbooru", server.uri(), "login", "key")
            .with_timeout(Duration::from_secs(2))
            .with_max_attempts(3)
    }

    fn post_body() -> serde_json::Value {
        json!({
            "data": [{
                "id": 4211,
                "file_url": "https://example.com/image.jpg",
                "tag_string_general": "1girl long_hair",
                "tag_string_artist": "artist_name",
                "rating": "s"
            }]
        })
    }

    #[tokio::test]
    async fn fetch_returns_first_post() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("tags", "hatsune_miku 1girl"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(post_body()))
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let post = client
            .fetch_posts("hatsune_miku 1girl", 1, false)
            .await
            .unwrap()
            .expect("post expected");

        assert_eq!(post.id, 4211);
        assert_eq!(post.file_url.as_deref(), Some("https://example.com/image.jpg"));
    }

    #[tokio::test]
    async fn empty_data_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let post = client.fetch_posts("nothing_here", 1, true).await.unwrap();
        assert!(post.is_none());
    }

    #[tokio::test]
    async fn retries_on_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(post_body()))
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let post = client.fetch_posts("hatsune_miku", 1, true).await.unwrap();
        assert!(post.is_some());
    }

    #[tokio::test]
    async fn honors_retry_after_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(post_body()))
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let post = client.fetch_posts("hatsune_miku", 1, true).await.unwrap();
        assert!(post.is_some());
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let err = client.fetch_posts("hatsune_miku", 1, true).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status(404)));
    }

    #[tokio::test]
    async fn exhausted_retries_error_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let err = client.fetch_posts("hatsune_miku", 1, true).await.unwrap_err();
        assert!(matches!(err, UpstreamError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn response_fields_are_sanitized() {
        let server = MockServer::start().await;
        let body = json!({
            "data": [{
                "id": 1,
                "file_url": "https://example.com/image.jpg",
                "tag_string_artist": "artist<script>alert(1)</script>_name"
            }]
        });
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = BooruClient::new(config(&server)).unwrap();
        let post = client
            .fetch_posts("q", 1, true)
            .await
            .unwrap()
            .expect("post expected");
        assert_eq!(post.tag_string_artist.as_deref(), Some("artistalert(1)_name"));
    }

    #[tokio::test]
    async fn non_random_fetch_writes_through_cache() {
        use booru_cache::MemoryBackend;
        use std::sync::Arc;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(post_body()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CacheLayer::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60));
        let client = BooruClient::new(config(&server)).unwrap().with_cache(cache);

        let first = client.fetch_posts("hatsune_miku", 1, false).await.unwrap();
        assert!(first.is_some());

        // Served from cache; the mock's expect(1) verifies no second hit.
        let second = client.fetch_posts("hatsune_miku", 1, false).await.unwrap();
        assert_eq!(second.unwrap().id, first.unwrap().id);
    }

    #[test]
    fn rejects_empty_credentials() {
        let config = UpstreamConfig::new("danbooru", "https://example.com", "", "");
        assert!(matches!(
            BooruClient::new(config),
            Err(UpstreamError::Config(_))
        ));
    }
}
