//! Legacy signed stream URLs
//!
//! HMAC-SHA256 over `"<message_id>:<exp>"` with a shared secret, carried in
//! the `sig` and `exp` query parameters. Kept alongside session tokens for
//! callers that still mint links server-side.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Write as _;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature or expiration")]
    Missing,
    #[error("invalid expiration timestamp")]
    BadExpiration,
    #[error("signature expired")]
    Expired,
    #[error("invalid signature")]
    Mismatch,
}

/// Hex-encoded HMAC-SHA256 of `data` under `secret`.
#[must_use]
pub fn compute_signature(secret: &str, data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(data.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(encoded, "{byte:02x}");
    }
    encoded
}

/// Validate the `sig`/`exp` pair for a message id.
///
/// An empty secret allows every request (signing disabled). The signature
/// comparison is constant-time.
pub fn validate_signed_request(
    secret: &str,
    message_id: i64,
    signature: &str,
    expiration: &str,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Ok(());
    }
    if signature.is_empty() || expiration.is_empty() {
        return Err(SignatureError::Missing);
    }

    let exp: i64 = expiration.parse().map_err(|_| SignatureError::BadExpiration)?;
    if Utc::now().timestamp() > exp {
        return Err(SignatureError::Expired);
    }

    let expected = compute_signature(secret, &format!("{message_id}:{exp}"));
    if signature.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Mint a `(sig, exp)` pair valid for `expires_in` seconds.
#[must_use]
pub fn generate_signed_url(secret: &str, message_id: i64, expires_in: i64) -> (String, i64) {
    let exp = Utc::now().timestamp() + expires_in;
    let sig = compute_signature(secret, &format!("{message_id}:{exp}"));
    (sig, exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_signature_validates() {
        let (sig, exp) = generate_signed_url("k", 7, 60);
        assert_eq!(
            validate_signed_request("k", 7, &sig, &exp.to_string()),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (sig, exp) = generate_signed_url("k", 7, 60);
        let mut tampered = sig.into_bytes();
        tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert_eq!(
            validate_signed_request("k", 7, &tampered, &exp.to_string()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_signature_rejected() {
        let exp = Utc::now().timestamp() - 60;
        let sig = compute_signature("k", &format!("7:{exp}"));
        assert_eq!(
            validate_signed_request("k", 7, &sig, &exp.to_string()),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_wrong_message_id_rejected() {
        let (sig, exp) = generate_signed_url("k", 7, 60);
        assert_eq!(
            validate_signed_request("k", 8, &sig, &exp.to_string()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_missing_parameters_rejected() {
        assert_eq!(
            validate_signed_request("k", 7, "", "123"),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            validate_signed_request("k", 7, "abc", ""),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn test_bad_expiration_rejected() {
        assert_eq!(
            validate_signed_request("k", 7, "abc", "soon"),
            Err(SignatureError::BadExpiration)
        );
    }

    #[test]
    fn test_empty_secret_allows_all() {
        assert_eq!(validate_signed_request("", 7, "", ""), Ok(()));
    }

    #[test]
    fn test_comparison_timing_is_length_independent() {
        // Mismatches at different positions should take comparable time.
        // Sampled coarse check: no early-exit by orders of magnitude.
        let (sig, exp) = generate_signed_url("k", 7, 60);
        let exp = exp.to_string();

        let mut early = sig.clone().into_bytes();
        early[0] ^= 1;
        let mut late = sig.clone().into_bytes();
        let last = late.len() - 1;
        late[last] ^= 1;
        let early = String::from_utf8(early).unwrap();
        let late = String::from_utf8(late).unwrap();

        let time_for = |candidate: &str| {
            let start = std::time::Instant::now();
            for _ in 0..2000 {
                let _ = validate_signed_request("k", 7, candidate, &exp);
            }
            start.elapsed().as_nanos() as f64
        };

        let t_early = time_for(&early);
        let t_late = time_for(&late);
        let ratio = t_early.max(t_late) / t_early.min(t_late).max(1.0);
        assert!(ratio < 3.0, "timing ratio {ratio} suggests early exit");
    }
}
