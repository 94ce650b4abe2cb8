//! Signing and secret handling for outbound webhooks.
//!
//! - HMAC-SHA256 signatures over `{timestamp}.{payload}`, carried in the
//!   `X-1Sub-Signature` header as `t=<unix>,v1=<hex>`
//! - AES-256-GCM encryption for vendor webhook secrets at rest
//! - HMAC-based API key hashing for tool authentication

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature on every outbound delivery.
pub const SIGNATURE_HEADER: &str = "X-1Sub-Signature";

/// Maximum accepted clock skew between signing and verification.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// Hex-encoded HMAC-SHA256 over `{timestamp}.{payload}`.
///
/// Binding the timestamp into the signed message is what makes the
/// tolerance check in [`verify_signature`] meaningful: a replayed body
/// cannot be re-stamped without the secret.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    #[allow(clippy::unwrap_used)]
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Full header value for an outbound delivery: `t=<unix>,v1=<hex>`.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, payload))
}

/// Verify a `t=<unix>,v1=<hex>` signature against a raw payload.
///
/// `now` is passed in rather than read from the clock so callers (and
/// tests) control the tolerance window. Comparison is constant-time.
pub fn verify_signature(
    header: &str,
    secret: &str,
    payload: &[u8],
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| BillingError::SignatureInvalid("missing timestamp".into()))?;
    let v1_signature = v1_signature
        .ok_or_else(|| BillingError::SignatureInvalid("missing v1 signature".into()))?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            skew = (now - timestamp).abs(),
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid(
            "timestamp outside tolerance".into(),
        ));
    }

    let computed = sign_payload(secret, timestamp, payload);
    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(BillingError::SignatureInvalid("signature mismatch".into()))
    }
}

/// Hash a tool API key for storage and lookup.
///
/// Keyed with a server-side pepper so a leaked `tools` table alone is not
/// enough to forge keys.
pub fn hash_api_key(pepper: &str, api_key: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    #[allow(clippy::unwrap_used)]
    let mut mac = <HmacSha256 as Mac>::new_from_slice(pepper.as_bytes()).unwrap();
    mac.update(api_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// SHA-256 of a lowercased, trimmed email, hex-encoded.
///
/// Tools that never see the raw address can still verify a user by
/// sending this digest.
pub fn hash_email(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Decode a 64-char hex string into the 32-byte AES-256 key.
pub fn parse_encryption_key(hex_key: &str) -> BillingResult<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| BillingError::Encryption(format!("encryption key is not hex: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        BillingError::Encryption(format!(
            "encryption key must be 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Encrypt a webhook secret for DB storage.
///
/// Output is `base64(nonce || ciphertext || tag)` with a fresh random
/// nonce per call.
pub fn encrypt_webhook_secret(plaintext: &str, key: &[u8; 32]) -> BillingResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BillingError::Encryption(e.to_string()))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| BillingError::Encryption(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(&blob))
}

/// Decrypt a stored webhook secret back to plaintext.
pub fn decrypt_webhook_secret(encoded: &str, key: &[u8; 32]) -> BillingResult<String> {
    let blob = BASE64
        .decode(encoded)
        .map_err(|e| BillingError::Encryption(format!("base64 decode failed: {e}")))?;

    if blob.len() <= NONCE_SIZE {
        return Err(BillingError::Encryption(
            "encrypted secret too short".into(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BillingError::Encryption(e.to_string()))?;

    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
    let plaintext = cipher
        .decrypt(nonce, &blob[NONCE_SIZE..])
        .map_err(|e| BillingError::Encryption(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| BillingError::Encryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0x42u8; 32]
    }

    #[test]
    fn signature_verifies_within_tolerance() {
        let secret = "whsec_test_secret";
        let payload = br#"{"id":"evt_1","type":"credits.consumed"}"#;
        let now = 1_706_400_000;

        let header = signature_header(secret, now, payload);
        assert!(verify_signature(&header, secret, payload, now).is_ok());
        assert!(verify_signature(&header, secret, payload, now + 299).is_ok());
        assert!(verify_signature(&header, secret, payload, now - 299).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let secret = "whsec_test_secret";
        let payload = b"{}";
        let now = 1_706_400_000;

        let header = signature_header(secret, now, payload);
        let err = verify_signature(&header, secret, payload, now + 301).unwrap_err();
        assert!(err.to_string().contains("tolerance"));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "whsec_test_secret";
        let now = 1_706_400_000;

        let header = signature_header(secret, now, b"{\"amount\":10}");
        assert!(verify_signature(&header, secret, b"{\"amount\":9999}", now).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = 1_706_400_000;
        let header = signature_header("secret-a", now, b"body");
        assert!(verify_signature(&header, "secret-b", b"body", now).is_err());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(verify_signature("", "s", b"body", 0).is_err());
        assert!(verify_signature("v1=deadbeef", "s", b"body", 0).is_err());
        assert!(verify_signature("t=12345", "s", b"body", 0).is_err());
        assert!(verify_signature("t=notanumber,v1=deadbeef", "s", b"body", 0).is_err());
    }

    #[test]
    fn header_parsing_tolerates_extra_parts() {
        let secret = "s";
        let payload = b"body";
        let now = 1_706_400_000;

        let sig = sign_payload(secret, now, payload);
        let header = format!("t={now},v1={sig},v0=legacy");
        assert!(verify_signature(&header, secret, payload, now).is_ok());
    }

    #[test]
    fn signature_is_hex_sha256() {
        let sig = sign_payload("secret", 1_706_400_000, b"payload");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn api_key_hash_depends_on_pepper() {
        let h1 = hash_api_key("pepper-one", "sk-tool-abc");
        let h2 = hash_api_key("pepper-two", "sk-tool-abc");
        let h3 = hash_api_key("pepper-one", "sk-tool-abc");
        assert_ne!(h1, h2);
        assert_eq!(h1, h3);
    }

    #[test]
    fn email_hash_normalizes_case_and_whitespace() {
        let a = hash_email("  Ada@Example.COM ");
        let b = hash_email("ada@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn secret_roundtrips_through_encryption() {
        let key = test_key();
        let encrypted = encrypt_webhook_secret("whsec_vendor_secret", &key).unwrap();
        assert_eq!(decrypt_webhook_secret(&encrypted, &key).unwrap(), "whsec_vendor_secret");
    }

    #[test]
    fn encryption_uses_fresh_nonces() {
        let key = test_key();
        let enc1 = encrypt_webhook_secret("same-secret", &key).unwrap();
        let enc2 = encrypt_webhook_secret("same-secret", &key).unwrap();
        assert_ne!(enc1, enc2);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let encrypted = encrypt_webhook_secret("secret", &[0x42u8; 32]).unwrap();
        assert!(decrypt_webhook_secret(&encrypted, &[0x43u8; 32]).is_err());
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let key = test_key();
        assert!(decrypt_webhook_secret("not base64!!!", &key).is_err());
        assert!(decrypt_webhook_secret(&BASE64.encode([0u8; 5]), &key).is_err());
    }

    #[test]
    fn encryption_key_parsing() {
        let hex_key = "42".repeat(32);
        assert_eq!(parse_encryption_key(&hex_key).unwrap(), test_key());
        assert!(parse_encryption_key("abcd").is_err());
        assert!(parse_encryption_key("zz".repeat(32).as_str()).is_err());
    }
}
