//! Cache layer over a pluggable backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::error::CacheResult;
use crate::key::cache_key;

/// The full tuple that identifies one cacheable fetch.
#[derive(Debug, Clone)]
pub struct CacheQuery<'a> {
    pub api_prefix: &'a str,
    pub query: &'a str,
    pub random: bool,
    pub limit: Option<u32>,
    pub tags: Option<&'a [String]>,
}

impl<'a> CacheQuery<'a> {
    pub fn new(api_prefix: &'a str, query: &'a str, random: bool) -> Self {
        Self {
            api_prefix,
            query,
            random,
            limit: None,
            tags: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_tags(mut self, tags: &'a [String]) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Derived storage key (§ key grammar in `key.rs`).
    pub fn key(&self) -> String {
        cache_key(self.api_prefix, self.query, self.random, self.limit, self.tags)
    }
}

/// Cache facade used by the fetcher and worker.
///
/// Backend failures degrade to misses: a broken cache must never take the
/// request path down with it. Corrupt values are deleted and reported as
/// misses.
#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a cached response; corrupt entries are deleted and miss.
    pub async fn get_cached_response<T: DeserializeOwned>(
        &self,
        query: &CacheQuery<'_>,
    ) -> Option<T> {
        let key = query.key();
        let raw = match self.backend.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key = key.as_str(), "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key = key.as_str(), "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Corrupt cache entry, deleting");
                if let Err(e) = self.backend.delete(&key).await {
                    warn!(key = key.as_str(), error = %e, "Failed to delete corrupt cache entry");
                }
                None
            }
        }
    }

    /// Store a response under the derived key.
    pub async fn set_cache<T: Serialize>(
        &self,
        query: &CacheQuery<'_>,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let key = query.key();
        let raw = serde_json::to_string(value)?;
        self.backend
            .set(&key, &raw, ttl.unwrap_or(self.default_ttl))
            .await?;
        debug!(key = key.as_str(), "Cache write");
        Ok(())
    }

    /// Delete the entry for one query tuple.
    pub async fn delete_cache(&self, query: &CacheQuery<'_>) -> CacheResult<bool> {
        self.backend.delete(&query.key()).await
    }

    /// Fetch-through: on miss call `fetch_fn`, cache non-null results.
    ///
    /// Null results are NOT cached. Cache failures on either side are logged
    /// and the fetch result is returned regardless.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        query: &CacheQuery<'_>,
        ttl: Option<Duration>,
        fetch_fn: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(cached) = self.get_cached_response(query).await {
            return Ok(Some(cached));
        }

        let fetched = fetch_fn().await?;
        if let Some(value) = &fetched {
            if let Err(e) = self.set_cache(query, value, ttl).await {
                warn!(error = %e, "Cache write-through failed, result served uncached");
            }
        }
        Ok(fetched)
    }

    /// Delete every key matching a wildcard pattern.
    ///
    /// Backends without pattern support report 0 with a warning.
    pub async fn invalidate_cache(&self, pattern: &str) -> CacheResult<u64> {
        match self.backend.delete_pattern(pattern).await? {
            Some(deleted) => Ok(deleted),
            None => {
                warn!(
                    pattern = pattern,
                    "Cache backend does not support pattern invalidation"
                );
                Ok(0)
            }
        }
    }

    /// Invalidate everything cached for one upstream api.
    pub async fn invalidate_by_prefix(&self, api_prefix: &str) -> CacheResult<u64> {
        self.invalidate_cache(&format!("cache:{}:*", api_prefix.to_lowercase()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cached {
        id: u64,
        url: String,
    }

    fn layer() -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60))
    }

    fn sample() -> Cached {
        Cached {
            id: 7,
            url: "https://example.com/image.jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn set_then_get_within_ttl() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "hatsune_miku", false);

        cache.set_cache(&query, &sample(), None).await.unwrap();
        let hit: Option<Cached> = cache.get_cached_response(&query).await;
        assert_eq!(hit, Some(sample()));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "hatsune_miku", false);

        cache
            .set_cache(&query, &sample(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let hit: Option<Cached> = cache.get_cached_response(&query).await;
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_deleted_and_misses() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheLayer::new(backend.clone(), Duration::from_secs(60));
        let query = CacheQuery::new("danbooru", "hatsune_miku", false);

        backend
            .set(&query.key(), "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        let hit: Option<Cached> = cache.get_cached_response(&query).await;
        assert_eq!(hit, None);
        assert_eq!(backend.get(&query.key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_or_set_caches_non_null() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "hatsune_miku", false);

        let fetched: Option<Cached> = cache
            .get_or_set(&query, None, || async { Ok::<_, String>(Some(sample())) })
            .await
            .unwrap();
        assert_eq!(fetched, Some(sample()));

        // Second call must be served from cache; a fetch would error out.
        let cached: Option<Cached> = cache
            .get_or_set(&query, None, || async {
                Err::<Option<Cached>, String>("fetch fn must not run on cache hit".to_string())
            })
            .await
            .unwrap();
        assert_eq!(cached, Some(sample()));
    }

    #[tokio::test]
    async fn get_or_set_does_not_cache_null() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "empty_query", false);

        let first: Option<Cached> = cache
            .get_or_set(&query, None, || async { Ok::<_, String>(None) })
            .await
            .unwrap();
        assert_eq!(first, None);

        // Null was not cached, so the fetch fn runs again.
        let second: Option<Cached> = cache
            .get_or_set(&query, None, || async { Ok::<_, String>(Some(sample())) })
            .await
            .unwrap();
        assert_eq!(second, Some(sample()));
    }

    #[tokio::test]
    async fn get_or_set_propagates_fetch_errors() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "boom", false);

        let result: Result<Option<Cached>, String> = cache
            .get_or_set(&query, None, || async { Err("upstream down".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "upstream down");
    }

    #[tokio::test]
    async fn delete_cache_removes_one_tuple() {
        let cache = layer();
        let query = CacheQuery::new("danbooru", "hatsune_miku", false);

        cache.set_cache(&query, &sample(), None).await.unwrap();
        assert!(cache.delete_cache(&query).await.unwrap());
        assert!(!cache.delete_cache(&query).await.unwrap());

        let miss: Option<Cached> = cache.get_cached_response(&query).await;
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn invalidate_by_prefix_only_hits_that_api() {
        let cache = layer();
        let danbooru = CacheQuery::new("danbooru", "q1", false);
        let gelbooru = CacheQuery::new("gelbooru", "q1", false);

        cache.set_cache(&danbooru, &sample(), None).await.unwrap();
        cache.set_cache(&gelbooru, &sample(), None).await.unwrap();

        let deleted = cache.invalidate_by_prefix("danbooru").await.unwrap();
        assert_eq!(deleted, 1);

        let miss: Option<Cached> = cache.get_cached_response(&danbooru).await;
        assert_eq!(miss, None);
        let hit: Option<Cached> = cache.get_cached_response(&gelbooru).await;
        assert_eq!(hit, Some(sample()));
    }
}
