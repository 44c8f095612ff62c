//! Deterministic cache key derivation.
//!
//! Key grammar:
//!
//! ```text
//! cache:{apiPrefix}:posts:{md5(normalize(query))}
//!    [:limit:{N}]             -- if a limit was supplied
//!    [:seed:{seed16}]         -- if random=true
//!    [:tag:{md5(sortedTags)}] -- if tags were provided
//! ```
//!
//! The seed is the first 16 hex chars of `sha256(query|limit|sortedTags)`,
//! which makes "random" results reproducible for identical inputs within the
//! cache TTL. Plaintext queries never appear in keys.

use booru_crypto::{md5_hex, sha256_hex};

/// Trim, lowercase, and collapse internal whitespace to single spaces.
pub fn normalize_query(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sort tags and join them into the canonical form hashed into keys.
fn sorted_tags(tags: &[String]) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Derive the cache key for a `(api, query, random, limit, tags)` tuple.
pub fn cache_key(
    api_prefix: &str,
    query: &str,
    random: bool,
    limit: Option<u32>,
    tags: Option<&[String]>,
) -> String {
    let normalized = normalize_query(query);
    let mut key = format!(
        "cache:{}:posts:{}",
        api_prefix.to_lowercase(),
        md5_hex(&normalized)
    );

    if let Some(limit) = limit {
        key.push_str(&format!(":limit:{}", limit));
    }

    if random {
        let tag_part = tags.map(sorted_tags).unwrap_or_default();
        let limit_part = limit.map(|l| l.to_string()).unwrap_or_default();
        let seed_input = format!("{}|{}|{}", normalized, limit_part, tag_part);
        let seed = &sha256_hex(&seed_input)[..16];
        key.push_str(&format!(":seed:{}", seed));
    }

    if let Some(tags) = tags.filter(|t| !t.is_empty()) {
        key.push_str(&format!(":tag:{}", md5_hex(&sorted_tags(tags))));
    }

    key
}
