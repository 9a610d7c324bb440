//! Cryptographic primitives consumed by the covenant engine.
//!
//! Ed25519 via `ed25519-dalek`, SHA-256 via `sha2`, JCS (RFC 8785) style JSON
//! canonicalization, strict lowercase hex and unpadded base64url codecs, nonce
//! generation and the protocol's timestamp format.

use crate::SteleError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length in bytes of protocol nonces.
pub const NONCE_LENGTH: usize = 32;

/// Length in bytes of an Ed25519 signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// An Ed25519 key pair together with the hex encoding of its public half.
#[derive(Clone)]
pub struct KeyPair {
    pub signing_key: ed25519_dalek::SigningKey,
    pub verifying_key: ed25519_dalek::VerifyingKey,
    pub public_key_hex: String,
}

impl KeyPair {
    fn from_signing_key(signing_key: ed25519_dalek::SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let public_key_hex = to_hex(verifying_key.as_bytes());
        KeyPair {
            signing_key,
            verifying_key,
            public_key_hex,
        }
    }

    /// The raw 32-byte private key.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_hex", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

/// Generate a new Ed25519 key pair from the thread-local CSPRNG.
pub fn generate_key_pair() -> KeyPair {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    KeyPair::from_signing_key(ed25519_dalek::SigningKey::from_bytes(&secret))
}

/// Reconstruct a `KeyPair` from a 32-byte private key.
///
/// # Errors
/// Returns `SteleError::Crypto` if the slice is not exactly 32 bytes.
pub fn key_pair_from_private_key(bytes: &[u8]) -> Result<KeyPair, SteleError> {
    let secret: [u8; 32] = bytes.try_into().map_err(|_| {
        SteleError::Crypto(format!("private key must be 32 bytes, got {}", bytes.len()))
    })?;
    Ok(KeyPair::from_signing_key(
        ed25519_dalek::SigningKey::from_bytes(&secret),
    ))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn verifying_key_from_hex(public_key_hex: &str) -> Result<ed25519_dalek::VerifyingKey, SteleError> {
    let bytes = from_hex(public_key_hex)?;
    let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        SteleError::Crypto(format!("public key must be 32 bytes, got {}", bytes.len()))
    })?;
    ed25519_dalek::VerifyingKey::from_bytes(&array)
        .map_err(|e| SteleError::Crypto(format!("invalid public key: {e}")))
}

/// Sign a message, returning the 64-byte signature.
pub fn sign(message: &[u8], signing_key: &ed25519_dalek::SigningKey) -> Vec<u8> {
    signing_key.sign(message).to_bytes().to_vec()
}

/// Verify an Ed25519 signature. Malformed signatures verify as `false`.
pub fn verify(
    message: &[u8],
    signature: &[u8],
    verifying_key: &ed25519_dalek::VerifyingKey,
) -> bool {
    let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}

/// Verify a hex-encoded signature against a hex-encoded public key.
///
/// Any decoding failure is reported as an invalid signature.
pub fn verify_hex(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    let Ok(verifying_key) = verifying_key_from_hex(public_key_hex) else {
        return false;
    };
    match from_hex(signature_hex) {
        Ok(signature) => verify(message, &signature, &verifying_key),
        Err(_) => false,
    }
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// SHA-256 of a UTF-8 string as lowercase hex.
pub fn sha256_string(data: &str) -> String {
    sha256_hex(data.as_bytes())
}

/// SHA-256 of a JSON value's canonical form.
pub fn sha256_object(obj: &serde_json::Value) -> String {
    sha256_string(&canonicalize_json(obj))
}

/// Deterministic JSON serialization following JCS (RFC 8785).
///
/// Object keys are ordered by their UTF-16 code units, output is compact,
/// and numbers use ECMAScript formatting (`1e-7`, `1e+21`, `2` for `2.0`).
pub fn canonicalize_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

// Every number is treated as an IEEE 754 double and printed the way
// ECMAScript's Number.prototype.toString prints it.
fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(f) = n.as_f64() {
        let mut buffer = ryu_js::Buffer::new();
        out.push_str(buffer.format(f));
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// 32 bytes from the CSPRNG, used as a document nonce.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Strict hex decoding: even length and lowercase digits only.
///
/// # Errors
/// Returns `SteleError::InvalidInput` for odd-length or non-lowercase-hex input.
pub fn from_hex(s: &str) -> Result<Vec<u8>, SteleError> {
    if s.len() % 2 != 0 {
        return Err(SteleError::invalid(
            "hex",
            format!("odd-length hex string ({} chars)", s.len()),
        ));
    }
    if let Some(bad) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(SteleError::invalid(
            "hex",
            format!("unexpected character {bad:?}"),
        ));
    }
    hex::decode(s).map_err(|e| SteleError::invalid("hex", e.to_string()))
}

/// Returns `true` when `s` is lowercase hex encoding exactly `bytes` bytes.
pub fn is_hex_of_len(s: &str, bytes: usize) -> bool {
    s.len() == bytes * 2 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Unpadded base64url encoding.
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Unpadded base64url decoding.
pub fn base64url_decode(s: &str) -> Result<Vec<u8>, SteleError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| SteleError::invalid("base64url", e.to_string()))
}

/// Constant-time comparison of two byte slices.
///
/// Lengths are compared first; equal-length inputs take time proportional
/// to their length regardless of where they differ.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

/// The current UTC time in protocol format (`YYYY-MM-DDTHH:MM:SS.sssZ`).
pub fn timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Render a UTC instant in protocol format.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 / ISO-8601 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Returns `true` only for the exact wire format: millisecond precision, `Z` suffix.
pub fn is_protocol_timestamp(s: &str) -> bool {
    s.len() == 24
        && s.ends_with('Z')
        && parse_timestamp(s).is_some_and(|dt| format_timestamp(&dt) == s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_sign_verify() {
        let kp = generate_key_pair();
        let message = b"hello stele";
        let sig = sign(message, &kp.signing_key);
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert!(verify(message, &sig, &kp.verifying_key));
        assert!(!verify(b"tampered", &sig, &kp.verifying_key));
    }

    #[test]
    fn test_verify_hex_rejects_malformed_inputs() {
        let kp = generate_key_pair();
        let sig = to_hex(&sign(b"m", &kp.signing_key));
        assert!(verify_hex(b"m", &sig, &kp.public_key_hex));
        assert!(!verify_hex(b"m", &sig[1..], &kp.public_key_hex));
        assert!(!verify_hex(b"m", &sig, "abcd"));
        assert!(!verify_hex(b"m", &sig.to_uppercase(), &kp.public_key_hex));
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256_string("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_canonicalize_json() {
        let obj = serde_json::json!({"z": 1, "a": [3, {"y": true, "b": null}]});
        assert_eq!(
            canonicalize_json(&obj),
            r#"{"a":[3,{"b":null,"y":true}],"z":1}"#
        );
    }

    #[test]
    fn test_canonicalize_numbers_and_escapes() {
        let obj = serde_json::json!({"f": 2.0, "g": 0.5, "s": "a\"b\\c\n\u{01}"});
        assert_eq!(
            canonicalize_json(&obj),
            r#"{"f":2,"g":0.5,"s":"a\"b\\c\n\u0001"}"#
        );
    }

    #[test]
    fn test_canonicalize_numbers_match_ecmascript() {
        let cases = [
            (1e-7, "1e-7"),
            (1e21, "1e+21"),
            (1.2345678901234568e20, "123456789012345680000"),
            (1e300, "1e+300"),
            (-0.0, "0"),
            (0.000001, "0.000001"),
            (4.5e-324, "5e-324"),
        ];
        for (input, expected) in cases {
            let value = serde_json::json!([input]);
            assert_eq!(canonicalize_json(&value), format!("[{expected}]"), "{input:e}");
        }
        // Integers beyond 2^53 collapse to the nearest double.
        assert_eq!(canonicalize_json(&serde_json::json!(9007199254740993u64)), "9007199254740992");
    }

    #[test]
    fn test_canonicalize_orders_by_utf16() {
        // U+FF61 sorts before U+1F600 in UTF-8 byte order but after it in UTF-16.
        let obj = serde_json::json!({"\u{1F600}": 1, "\u{FF61}": 2});
        assert_eq!(canonicalize_json(&obj), "{\"\u{1F600}\":1,\"\u{FF61}\":2}");
    }

    #[test]
    fn test_hex_codec_is_strict() {
        assert_eq!(from_hex("00ff").unwrap(), vec![0u8, 255]);
        assert!(from_hex("abc").is_err());
        assert!(from_hex("ABCD").is_err());
        assert!(from_hex("zz").is_err());
        assert_eq!(to_hex(&[0xab, 0x01]), "ab01");
    }

    #[test]
    fn test_base64url_roundtrip() {
        let bytes = [0xfbu8, 0xff, 0x00, 0x10];
        let encoded = base64url_encode(&bytes);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert_eq!(base64url_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal(b"abc", b"abc"));
        assert!(!constant_time_equal(b"abc", b"abd"));
        assert!(!constant_time_equal(b"ab", b"abc"));
    }

    #[test]
    fn test_key_pair_from_private_key() {
        let kp = generate_key_pair();
        let restored = key_pair_from_private_key(&kp.private_key_bytes()).unwrap();
        assert_eq!(kp.public_key_hex, restored.public_key_hex);
        assert!(key_pair_from_private_key(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert!(is_protocol_timestamp(&ts), "unexpected format: {ts}");
        assert!(!is_protocol_timestamp("2025-01-01T00:00:00Z"));
        assert!(!is_protocol_timestamp("2025-01-01T00:00:00.000+00:00"));
        assert!(is_protocol_timestamp("2025-01-01T00:00:00.000Z"));
    }
}
