//! Atomic counter-window rate limiter.

use std::time::Duration;

use redis::Script;
use tracing::debug;

use crate::error::QueueResult;

/// One atomic INCR-and-window primitive. Only the first increment arms the
/// TTL; `current == limit` is still allowed.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
if current <= tonumber(ARGV[2]) then
    return 1
else
    return 0
end
"#;

/// Fixed windows exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingWindow {
    Minute,
    Hour,
    Day,
}

impl SlidingWindow {
    pub fn seconds(&self) -> u64 {
        match self {
            SlidingWindow::Minute => 60,
            SlidingWindow::Hour => 3600,
            SlidingWindow::Day => 86400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlidingWindow::Minute => "minute",
            SlidingWindow::Hour => "hour",
            SlidingWindow::Day => "day",
        }
    }
}

/// Counter key for an `(api, identifier)` pair.
pub fn rate_key(api_prefix: &str, identifier: &str) -> String {
    format!("rate:{}:{}", api_prefix.to_lowercase(), identifier)
}

/// Current counter state for admin/stats reads.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub key: String,
    pub current: u64,
    /// Seconds until the window resets; negative when the key is absent
    pub ttl_seconds: i64,
}

/// Rate limiter over per-`(api, identifier)` counter windows.
#[derive(Clone)]
pub struct RateLimiter {
    client: redis::Client,
}

impl RateLimiter {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Returns true when the request is allowed. The counter increments on
    /// every call, allowed or not.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        api_prefix: &str,
        limit: u64,
        window: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = rate_key(api_prefix, identifier);

        let allowed: i64 = Script::new(WINDOW_SCRIPT)
            .key(&key)
            .arg(window.as_secs())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        if allowed != 1 {
            debug!(key = key.as_str(), limit = limit, "Rate limit exceeded");
        }
        Ok(allowed == 1)
    }

    /// Fixed-window convenience; `client_id = None` counts against the
    /// api-global bucket.
    pub async fn check_sliding_window(
        &self,
        api_prefix: &str,
        client_id: Option<&str>,
        limit: u64,
        window: SlidingWindow,
    ) -> QueueResult<bool> {
        let identifier = format!("{}:{}", client_id.unwrap_or("global"), window.as_str());
        self.check_rate_limit(
            &identifier,
            api_prefix,
            limit,
            Duration::from_secs(window.seconds()),
        )
        .await
    }

    /// Composite check: one pipeline running the window script for every
    /// identifier. Blocked iff any individual result is over-limit. Every
    /// identifier is still incremented, which is the documented behavior.
    pub async fn check_composite_rate_limit(
        &self,
        api_prefix: &str,
        identifiers: &[String],
        limit: u64,
        window: Duration,
    ) -> QueueResult<bool> {
        if identifiers.is_empty() {
            return Ok(true);
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut pipe = redis::pipe();
        for identifier in identifiers {
            pipe.cmd("EVAL")
                .arg(WINDOW_SCRIPT)
                .arg(1)
                .arg(rate_key(api_prefix, identifier))
                .arg(window.as_secs())
                .arg(limit);
        }

        let results: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(results.iter().all(|allowed| *allowed == 1))
    }

    /// Read-only counter stats.
    pub async fn get_rate_limit_stats(
        &self,
        api_prefix: &str,
        identifier: &str,
    ) -> QueueResult<RateLimitStats> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = rate_key(api_prefix, identifier);

        let (current, ttl_seconds): (Option<u64>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&key)
            .cmd("TTL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        Ok(RateLimitStats {
            key,
            current: current.unwrap_or(0),
            ttl_seconds,
        })
    }

    /// Admin delete of one counter window.
    pub async fn reset_rate_limit(&self, api_prefix: &str, identifier: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: u64 = redis::cmd("DEL")
            .arg(rate_key(api_prefix, identifier))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}
