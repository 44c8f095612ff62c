//! Cache storage backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::CacheResult;

/// Storage backend for the cache layer.
///
/// `delete_pattern` returns `None` when the backend cannot enumerate keys by
/// wildcard pattern; the cache layer maps that to "0 deleted" with a warning.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<bool>;
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<Option<u64>>;
}

/// Redis-backed cache storage.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn from_url(url: &str) -> CacheResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: u64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<Option<u64>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(Some(0));
        }

        let mut cmd = redis::cmd("DEL");
        for key in &keys {
            cmd.arg(key);
        }
        let deleted: u64 = cmd.query_async(&mut conn).await?;
        debug!(pattern = pattern, deleted = deleted, "Invalidated cache keys");
        Ok(Some(deleted))
    }
}

/// In-process cache storage for tests and single-node runs.
///
/// Pattern deletion supports `*` globs only; patterns using `?` or character
/// classes report unsupported.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn glob_match(pattern: &str, key: &str) -> bool {
        // Segments between '*' must appear in order; anchored at both ends.
        let segments: Vec<&str> = pattern.split('*').collect();
        if segments.len() == 1 {
            return pattern == key;
        }

        let first = segments[0];
        let last = segments[segments.len() - 1];
        if !key.starts_with(first) {
            return false;
        }

        let mut rest = &key[first.len()..];
        for segment in &segments[1..segments.len() - 1] {
            if segment.is_empty() {
                continue;
            }
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }

        last.is_empty() || rest.ends_with(last)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries
            .get(key)
            .map(|(value, expires_at)| (value.clone(), *expires_at))
        {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        Ok(entries.remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<Option<u64>> {
        if pattern.contains('?') || pattern.contains('[') {
            return Ok(None);
        }
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let matching: Vec<String> = entries
            .keys()
            .filter(|key| Self::glob_match(pattern, key))
            .cloned()
            .collect();
        for key in &matching {
            entries.remove(key);
        }
        Ok(Some(matching.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_set_get_delete() {
        let backend = MemoryBackend::new();
        backend
            .set("k1", "v1", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.get("k1").await.unwrap().as_deref(), Some("v1"));
        assert!(backend.delete("k1").await.unwrap());
        assert!(!backend.delete("k1").await.unwrap());
        assert_eq!(backend.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_backend_expires_entries() {
        let backend = MemoryBackend::new();
        backend
            .set("k1", "v1", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_backend_pattern_delete() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.set("cache:danbooru:posts:a", "1", ttl).await.unwrap();
        backend.set("cache:danbooru:posts:b", "2", ttl).await.unwrap();
        backend.set("cache:gelbooru:posts:c", "3", ttl).await.unwrap();

        let deleted = backend
            .delete_pattern("cache:danbooru:*")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(backend.get("cache:danbooru:posts:a").await.unwrap(), None);
        assert!(backend.get("cache:gelbooru:posts:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_backend_reports_unsupported_patterns() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.delete_pattern("cache:?").await.unwrap(), None);
    }

    #[test]
    fn glob_matching() {
        assert!(MemoryBackend::glob_match("cache:*", "cache:a:b"));
        assert!(MemoryBackend::glob_match("cache:*:posts:*", "cache:a:posts:b"));
        assert!(MemoryBackend::glob_match("*", "anything"));
        assert!(!MemoryBackend::glob_match("cache:*", "other:a"));
        assert!(!MemoryBackend::glob_match("*:posts", "cache:posts:x"));
        assert!(MemoryBackend::glob_match("*:posts", "cache:posts"));
    }
}
