//! AES-256-GCM cipher for DLQ query payloads.
//!
//! Wire layout is `base64(IV ‖ TAG ‖ CIPHERTEXT)` with a 16-byte random IV,
//! a 16-byte auth tag, and a constant AAD binding payloads to this service.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

/// AES-256-GCM with the 16-byte IV the wire format mandates.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Additional authenticated data bound into every GCM tag.
const AAD: &[u8] = b"danbooru-gateway";

/// IV length in bytes.
const IV_LEN: usize = 16;

/// Auth tag length in bytes.
const TAG_LEN: usize = 16;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Malformed encrypted payload: {0}")]
    MalformedPayload(String),
}

/// Cipher owning the 32-byte service key.
#[derive(Clone)]
pub struct QueryCipher {
    key: Key<Aes256Gcm16>,
}

impl std::fmt::Debug for QueryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("QueryCipher").finish_non_exhaustive()
    }
}

impl QueryCipher {
    /// Build a cipher from the 64-hex-char key supplied via configuration.
    pub fn from_hex(key_hex: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not valid hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes (64 hex chars), got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm16>::from_slice(&bytes),
        })
    }

    /// Encrypt a query string to the base64 wire layout.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let cipher = Aes256Gcm16::new(&self.key);
        let iv = Aes256Gcm16::generate_nonce(&mut OsRng);

        let ciphertext_and_tag = cipher
            .encrypt(
                &iv,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;

        // aes-gcm appends the tag; the wire layout wants IV ‖ TAG ‖ CT
        let split = ciphertext_and_tag.len() - TAG_LEN;
        let (ciphertext, tag) = ciphertext_and_tag.split_at(split);

        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);

        Ok(BASE64.encode(out))
    }

    /// Decrypt a base64 wire payload back to the query string.
    pub fn decrypt(&self, encoded: &str) -> CryptoResult<String> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::MalformedPayload(format!("not valid base64: {}", e)))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::MalformedPayload(format!(
                "payload too short: {} bytes",
                raw.len()
            )));
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut ciphertext_and_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        ciphertext_and_tag.extend_from_slice(ciphertext);
        ciphertext_and_tag.extend_from_slice(tag);

        let cipher = Aes256Gcm16::new(&self.key);
        let plaintext = cipher
            .decrypt(
                Nonce::<U16>::from_slice(iv),
                Payload {
                    msg: &ciphertext_and_tag,
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::MalformedPayload("decrypted bytes are not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let encrypted = cipher.encrypt("hatsune_miku 1girl").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "hatsune_miku 1girl");
    }

    #[test]
    fn random_iv_makes_ciphertexts_differ() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let a = cipher.encrypt("same query").unwrap();
        let b = cipher.encrypt("same query").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let other = QueryCipher::from_hex(&"ff".repeat(32)).unwrap();
        let encrypted = cipher.encrypt("secret query").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn tampered_payload_fails_auth() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let encrypted = cipher.encrypt("secret query").unwrap();

        let mut raw = BASE64.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn rejects_short_payloads() {
        let cipher = QueryCipher::from_hex(KEY_HEX).unwrap();
        let short = BASE64.encode([0u8; 8]);
        assert!(matches!(
            cipher.decrypt(&short),
            Err(CryptoError::MalformedPayload(_))
        ));
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            QueryCipher::from_hex("deadbeef"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            QueryCipher::from_hex("zz".repeat(32).as_str()),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
