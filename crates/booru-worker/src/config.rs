//! Worker configuration.

use std::time::Duration;

use booru_queue::DlqPayloadMode;

/// Which cache backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    #[default]
    Redis,
    Memory,
}

impl CacheBackendKind {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "memory" | "in-memory" => CacheBackendKind::Memory,
            _ => CacheBackendKind::Redis,
        }
    }
}

/// Worker configuration, one value per knob the gateway exposes.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis URL
    pub redis_url: String,
    /// Api prefixes this process consumes, e.g. ["danbooru"]
    pub api_prefixes: Vec<String>,
    /// Hard upstream HTTP timeout
    pub api_timeout: Duration,
    /// XREADGROUP block duration
    pub stream_block: Duration,
    /// Per-identifier request budget per rate window
    pub rate_limit_per_minute: u64,
    /// Rate-limit window length
    pub rate_window: Duration,
    /// TTL on processed-job markers
    pub dedup_ttl: Duration,
    /// Upstream fetch attempts (including the first)
    pub max_retry_attempts: u32,
    /// Cap on upstream retry backoff and re-enqueue delays
    pub max_backoff: Duration,
    /// DLQ retries before promotion to the dead queue
    pub max_dlq_retries: u32,
    /// Query lock TTL, clamped to 30..300 seconds
    pub query_lock_timeout: Duration,
    /// DLQ duplicate-probe window
    pub dlq_dedup_window: Duration,
    /// Default cache entry TTL
    pub cache_ttl: Duration,
    /// 64-hex-char AES-256 key; required in encrypted DLQ mode
    pub encryption_key: Option<String>,
    /// DLQ payload mode, stated once at startup
    pub dlq_payload_mode: DlqPayloadMode,
    /// Cache backend selector
    pub cache_backend: CacheBackendKind,
    /// Shared secret enabling HMAC authentication of job envelopes
    pub hmac_secret: Option<String>,
    /// Upstream base URL
    pub upstream_base_url: String,
    /// Upstream basic auth login
    pub upstream_login: String,
    /// Upstream basic auth API key
    pub upstream_api_key: String,
    /// Concurrent in-flight messages per worker process
    pub max_concurrent_jobs: usize,
    /// How often the pending-entry scanner runs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending entry is claimed
    pub claim_min_idle: Duration,
    /// Graceful shutdown grace period
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            api_prefixes: vec!["danbooru".to_string()],
            api_timeout: Duration::from_millis(10_000),
            stream_block: Duration::from_millis(5_000),
            rate_limit_per_minute: 60,
            rate_window: Duration::from_secs(60),
            dedup_ttl: Duration::from_secs(86_400),
            max_retry_attempts: 5,
            max_backoff: Duration::from_millis(30_000),
            max_dlq_retries: 5,
            query_lock_timeout: Duration::from_secs(60),
            dlq_dedup_window: Duration::from_secs(3_600),
            cache_ttl: Duration::from_secs(3_600),
            encryption_key: None,
            dlq_payload_mode: DlqPayloadMode::Encrypted,
            cache_backend: CacheBackendKind::Redis,
            hmac_secret: None,
            upstream_base_url: String::new(),
            upstream_login: String::new(),
            upstream_api_key: String::new(),
            max_concurrent_jobs: 5,
            claim_interval: Duration::from_secs(60),
            claim_min_idle: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_prefixes = std::env::var("API_PREFIXES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.api_prefixes);

        let query_lock_secs: u64 = env_parse("QUERY_LOCK_TIMEOUT_SECONDS", 60).clamp(30, 300);

        let dlq_payload_mode = match std::env::var("DLQ_PAYLOAD_MODE").as_deref() {
            Ok("hash-only") | Ok("hash_only") => DlqPayloadMode::HashOnly,
            _ => DlqPayloadMode::Encrypted,
        };

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            api_prefixes,
            api_timeout: Duration::from_millis(env_parse("API_TIMEOUT_MS", 10_000)),
            stream_block: Duration::from_millis(env_parse("STREAM_BLOCK_MS", 5_000)),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 60),
            rate_window: Duration::from_secs(env_parse("RATE_WINDOW_SECONDS", 60)),
            dedup_ttl: Duration::from_secs(env_parse("DEDUP_TTL_SECONDS", 86_400)),
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", 5),
            max_backoff: Duration::from_millis(env_parse("MAX_BACKOFF_MS", 30_000)),
            max_dlq_retries: env_parse("MAX_DLQ_RETRIES", 5),
            query_lock_timeout: Duration::from_secs(query_lock_secs),
            dlq_dedup_window: Duration::from_secs(env_parse("DLQ_DEDUP_WINDOW_SECONDS", 3_600)),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 3_600)),
            encryption_key: std::env::var("ENCRYPTION_KEY").ok().filter(|k| !k.is_empty()),
            dlq_payload_mode,
            cache_backend: std::env::var("CACHE_BACKEND")
                .map(|raw| CacheBackendKind::parse(&raw))
                .unwrap_or_default(),
            hmac_secret: std::env::var("HMAC_SECRET").ok().filter(|s| !s.is_empty()),
            upstream_base_url: std::env::var("BOORU_BASE_URL").unwrap_or_default(),
            upstream_login: std::env::var("BOORU_LOGIN").unwrap_or_default(),
            upstream_api_key: std::env::var("BOORU_API_KEY").unwrap_or_default(),
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS", 5),
            claim_interval: Duration::from_secs(env_parse("WORKER_CLAIM_INTERVAL_SECS", 60)),
            claim_min_idle: Duration::from_secs(env_parse("WORKER_CLAIM_MIN_IDLE_SECS", 300)),
            shutdown_timeout: Duration::from_secs(env_parse("WORKER_SHUTDOWN_TIMEOUT", 30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.api_timeout, Duration::from_millis(10_000));
        assert_eq!(config.stream_block, Duration::from_millis(5_000));
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.dedup_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_dlq_retries, 5);
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.dlq_payload_mode, DlqPayloadMode::Encrypted);
    }

    #[test]
    fn cache_backend_parsing() {
        assert_eq!(CacheBackendKind::parse("memory"), CacheBackendKind::Memory);
        assert_eq!(CacheBackendKind::parse("redis"), CacheBackendKind::Redis);
        assert_eq!(CacheBackendKind::parse("unknown"), CacheBackendKind::Redis);
    }
}
