//! Cryptographic utilities for the booru gateway.
//!
//! This crate provides:
//! - AES-256-GCM encryption of DLQ query payloads
//! - SHA-256 / MD5 hex digests for dedup markers and cache keys
//! - HMAC-SHA-256 signing and verification of job envelopes

pub mod cipher;
pub mod hash;

pub use cipher::{CryptoError, CryptoResult, QueryCipher};
pub use hash::{envelope_payload, hmac_sign, hmac_verify, md5_hex, sha256_hex};
