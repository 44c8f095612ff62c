//! Upstream provider HTTP client.
//!
//! This crate provides:
//! - `fetch_posts` with retry on timeout/429/5xx honoring `Retry-After`
//! - Response sanitization against HTML/script injection
//! - Cache miss-through for non-random queries

pub mod client;
pub mod error;
pub mod sanitize;

pub use client::{BooruClient, UpstreamConfig};
pub use error::{UpstreamError, UpstreamResult};
pub use sanitize::{sanitize_post, sanitize_text};
