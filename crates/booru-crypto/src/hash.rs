//! Digest and HMAC helpers.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 hex digest.
pub fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// MD5 hex digest (cache-key component, not a security boundary).
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Sign a canonical payload, returning the hex-encoded HMAC-SHA-256 tag.
pub fn hmac_sign(secret: &[u8], payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Canonical payload both producers and the gateway sign: query and client
/// id, newline separated, absent client id signed as empty.
pub fn envelope_payload(query: &str, client_id: Option<&str>) -> String {
    format!("{}\n{}", query, client_id.unwrap_or(""))
}

/// Verify a hex-encoded HMAC-SHA-256 tag in constant time.
///
/// Malformed hex verifies as false rather than erroring; the caller only
/// needs the authentication outcome.
pub fn hmac_verify(secret: &[u8], payload: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn hmac_sign_then_verify() {
        let secret = b"shared-secret";
        let tag = hmac_sign(secret, "hatsune_miku 1girl\nu1");
        assert!(hmac_verify(secret, "hatsune_miku 1girl\nu1", &tag));
    }

    #[test]
    fn hmac_rejects_wrong_payload_or_secret() {
        let tag = hmac_sign(b"shared-secret", "payload");
        assert!(!hmac_verify(b"shared-secret", "other payload", &tag));
        assert!(!hmac_verify(b"other-secret", "payload", &tag));
    }

    #[test]
    fn hmac_rejects_malformed_hex() {
        assert!(!hmac_verify(b"shared-secret", "payload", "not-hex"));
        assert!(!hmac_verify(b"shared-secret", "payload", "abc"));
    }

    #[test]
    fn envelope_payload_is_stable() {
        assert_eq!(envelope_payload("query", Some("u1")), "query\nu1");
        assert_eq!(envelope_payload("query", None), "query\n");
    }
}
