//! Token-owned TTL locks with heartbeat extension.

use std::future::Future;
use std::time::Duration;

use redis::Script;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueResult;

/// CAS delete: only the owner token may release.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// CAS expire: only the owner token may extend.
const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock key serializing processing of one query on one api.
pub fn query_lock_key(api_prefix: &str, query_hash: &str) -> String {
    format!("lock:query:{}:{}", api_prefix.to_lowercase(), query_hash)
}

/// Distributed lock manager over token-owned keys.
#[derive(Clone)]
pub struct LockManager {
    client: redis::Client,
}

impl LockManager {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Atomic set-if-absent with TTL. Returns the owner token on success.
    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        if acquired.is_some() {
            debug!(key = key, "Acquired lock");
            Ok(Some(token))
        } else {
            debug!(key = key, "Lock held elsewhere");
            Ok(None)
        }
    }

    /// Acquire with bounded retries and exponential backoff (base × 2ⁿ).
    pub async fn acquire_lock_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        base_delay: Duration,
    ) -> QueueResult<Option<String>> {
        let mut attempt = 0u32;
        loop {
            if let Some(token) = self.acquire_lock(key, ttl).await? {
                return Ok(Some(token));
            }
            if attempt >= max_retries {
                return Ok(None);
            }
            let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt));
            debug!(key = key, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying lock acquisition");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Extend the TTL iff the token still owns the lock.
    pub async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let extended: i32 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    /// Release iff the token still owns the lock. Second release is a no-op
    /// returning false.
    pub async fn release_lock(&self, key: &str, token: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i32 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 1 {
            debug!(key = key, "Released lock");
        }
        Ok(deleted == 1)
    }

    /// Run `f` under the lock with a heartbeat extending it every
    /// `heartbeat` interval. Returns `None` when the lock was not acquired.
    ///
    /// Release errors are logged, never surfaced; heartbeat failures are
    /// logged and the operation runs to completion regardless.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        heartbeat: Duration,
        f: F,
    ) -> QueueResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire_lock(key, ttl).await? else {
            return Ok(None);
        };

        let heartbeat_task = {
            let manager = self.clone();
            let key = key.to_string();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(heartbeat);
                interval.tick().await; // first tick fires immediately
                loop {
                    interval.tick().await;
                    match manager.extend_lock(&key, &token, ttl).await {
                        Ok(true) => debug!(key = key.as_str(), "Extended lock"),
                        Ok(false) => {
                            warn!(key = key.as_str(), "Lock lost during heartbeat");
                            break;
                        }
                        Err(e) => {
                            warn!(key = key.as_str(), error = %e, "Lock heartbeat failed");
                        }
                    }
                }
            })
        };

        let result = f().await;

        heartbeat_task.abort();
        if let Err(e) = self.release_lock(key, &token).await {
            warn!(key = key, error = %e, "Failed to release lock, TTL will reap it");
        }

        Ok(Some(result))
    }
}
