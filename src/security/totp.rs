//! Time-based one-time password verification (RFC 6238).
//!
//! Backs the built-in `/api/totp` endpoint: HMAC-SHA1 over the moving time
//! counter, dynamic truncation to six digits. The previous time step is
//! also accepted to absorb clock skew between client and server.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error, PartialEq)]
pub enum TotpError {
    #[error("err.invalidsecret")]
    InvalidSecret,
    #[error("err.invalidtoken")]
    Mismatch,
}

/// Verify a six-digit code against a base32-encoded shared secret.
/// `step_secs` is the time-step duration (normally 30).
pub fn verify(step_secs: u64, token: &str, secret_base32: &str) -> Result<(), TotpError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    verify_at(step_secs, token, secret_base32, now)
}

fn verify_at(step_secs: u64, token: &str, secret_base32: &str, now: u64) -> Result<(), TotpError> {
    if step_secs == 0 || token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TotpError::Mismatch);
    }
    let key = decode_base32(secret_base32).ok_or(TotpError::InvalidSecret)?;
    if key.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    let counter = now / step_secs;
    // current step, then the previous one
    for c in [counter, counter.saturating_sub(1)] {
        if hotp(&key, c) == token {
            return Ok(());
        }
    }
    Err(TotpError::Mismatch)
}

fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let code = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    format!("{:06}", code % 1_000_000)
}

/// RFC 4648 base32 decode, case-insensitive, tolerating padding and
/// whitespace. None of the corpus crates cover base32, so the 32-symbol
/// table decode lives here.
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u8;
    for c in input.bytes() {
        if c == b'=' || c.is_ascii_whitespace() {
            continue;
        }
        let v = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())? as u32;
        acc = (acc << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 reference secret: ASCII "12345678901234567890"
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_decode_base32() {
        assert_eq!(
            decode_base32(RFC_SECRET).unwrap(),
            b"12345678901234567890".to_vec()
        );
        assert_eq!(decode_base32("MZXW6===").unwrap(), b"foo".to_vec());
        assert_eq!(decode_base32("mzxw6").unwrap(), b"foo".to_vec());
        assert!(decode_base32("01!").is_none());
    }

    #[test]
    fn test_rfc6238_vector_at_59s() {
        // RFC 6238 appendix B: T = 59, step 30 → 94287082; six digits → 287082
        assert_eq!(verify_at(30, "287082", RFC_SECRET, 59), Ok(()));
    }

    #[test]
    fn test_previous_step_accepted() {
        // 287082 belongs to counter 1 (30..59); still valid during counter 2
        assert_eq!(verify_at(30, "287082", RFC_SECRET, 61), Ok(()));
        // two steps back is rejected
        assert_eq!(
            verify_at(30, "287082", RFC_SECRET, 121),
            Err(TotpError::Mismatch)
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            verify_at(30, "12345", RFC_SECRET, 59),
            Err(TotpError::Mismatch)
        );
        assert_eq!(
            verify_at(30, "abcdef", RFC_SECRET, 59),
            Err(TotpError::Mismatch)
        );
        assert_eq!(
            verify_at(0, "287082", RFC_SECRET, 59),
            Err(TotpError::Mismatch)
        );
        assert_eq!(
            verify_at(30, "287082", "not base32 at all!", 59),
            Err(TotpError::InvalidSecret)
        );
    }
}
