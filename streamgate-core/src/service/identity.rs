//! Federated identity verifier
//!
//! Validates RS256 ID tokens minted by the configured identity provider and
//! extracts the subject and email. Signing keys rotate: they are fetched
//! from the provider's certs endpoint, cached for the advertised
//! `Cache-Control: max-age`, and force-refreshed exactly once when an
//! unknown `kid` shows up. The refresh is serialized under the write lock
//! with a double-checked freshness test so a burst of requests carrying a
//! new `kid` cannot stampede the endpoint.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const DEFAULT_CERTS_CACHE_TTL: Duration = Duration::from_secs(3600);
const CERTS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Allowed forward clock skew on `iat`.
const MAX_ISSUED_AT_SKEW_SECS: i64 = 300;

/// Verified claims from an ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
}

/// Distinct failure conditions, logged individually but all mapped to one
/// user-visible "invalid token" error.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed token")]
    Malformed,
    #[error("unexpected signing algorithm")]
    WrongAlgorithm,
    #[error("missing key id")]
    MissingKeyId,
    #[error("signing key not found for kid={0}")]
    UnknownKeyId(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("invalid audience")]
    WrongAudience,
    #[error("invalid issuer")]
    WrongIssuer,
    #[error("invalid subject")]
    InvalidSubject,
    #[error("certs endpoint error: {0}")]
    CertsFetch(String),
}

// `exp`, `aud` and `iss` are enforced by the validation layer and not
// carried here.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    iat: i64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
}

/// Extract an RSA verification key from one entry of the certs endpoint's
/// `kid → PEM` map. The endpoint serves X.509 certificates; a bare public
/// key PEM is accepted as well.
fn decoding_key_from_pem(pem: &str) -> std::result::Result<DecodingKey, String> {
    if pem.contains("BEGIN CERTIFICATE") {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| format!("invalid pem block: {e:?}"))?;
        let cert = parsed
            .parse_x509()
            .map_err(|e| format!("invalid certificate: {e}"))?;
        match cert.public_key().parsed() {
            Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => Ok(
                DecodingKey::from_rsa_raw_components(rsa.modulus, rsa.exponent),
            ),
            Ok(_) => Err("certificate does not contain an rsa key".to_string()),
            Err(e) => Err(format!("invalid certificate key: {e}")),
        }
    } else {
        DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| format!("invalid public key pem: {e}"))
    }
}

struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    expires_at: Instant,
}

pub struct IdentityVerifier {
    project_id: String,
    issuer: String,
    certs_url: String,
    client: reqwest::Client,
    cache: RwLock<KeyCache>,
}

impl IdentityVerifier {
    pub fn new(project_id: &str, issuer_prefix: &str, certs_url: &str) -> Result<Self> {
        if project_id.is_empty() {
            return Err(Error::Internal("identity project id is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(CERTS_FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("build certs client: {e}")))?;

        Ok(Self {
            project_id: project_id.to_string(),
            issuer: format!("{}/{}", issuer_prefix.trim_end_matches('/'), project_id),
            certs_url: certs_url.to_string(),
            client,
            cache: RwLock::new(KeyCache {
                keys: HashMap::new(),
                expires_at: Instant::now(),
            }),
        })
    }

    /// Verify a raw ID token and extract its claims.
    ///
    /// Every distinct failure is logged with its condition; callers see a
    /// single authentication error.
    pub async fn verify(&self, raw_token: &str) -> Result<IdentityClaims> {
        self.verify_inner(raw_token).await.map_err(|condition| {
            warn!(%condition, "identity token rejected");
            Error::Authentication("invalid identity token".to_string())
        })
    }

    async fn verify_inner(&self, raw_token: &str) -> std::result::Result<IdentityClaims, IdentityError> {
        let header = jsonwebtoken::decode_header(raw_token).map_err(|_| IdentityError::Malformed)?;
        if header.alg != Algorithm::RS256 {
            return Err(IdentityError::WrongAlgorithm);
        }
        let kid = header.kid.ok_or(IdentityError::MissingKeyId)?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);

        let token = jsonwebtoken::decode::<RawClaims>(raw_token, &key, &validation)
            .map_err(map_decode_error)?;
        let claims = token.claims;

        let now = chrono::Utc::now().timestamp();
        if claims.iat > now + MAX_ISSUED_AT_SKEW_SECS {
            return Err(IdentityError::IssuedInFuture);
        }
        if claims.sub.is_empty() || claims.sub.len() > 128 {
            return Err(IdentityError::InvalidSubject);
        }

        Ok(IdentityClaims {
            subject: claims.sub,
            email: claims.email.unwrap_or_default(),
            email_verified: claims.email_verified.unwrap_or(false),
        })
    }

    /// Look up a signing key, refreshing the cache when the kid is unknown
    /// or the cache has aged out.
    async fn key_for(&self, kid: &str) -> std::result::Result<DecodingKey, IdentityError> {
        {
            let cache = self.cache.read().await;
            let fresh = Instant::now() < cache.expires_at && !cache.keys.is_empty();
            if fresh {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        // Slow path: take the write lock and re-check before refreshing so
        // concurrent verifiers for the same unknown kid refresh only once.
        let mut cache = self.cache.write().await;
        let fresh = Instant::now() < cache.expires_at && !cache.keys.is_empty();
        if !fresh || !cache.keys.contains_key(kid) {
            let (keys, ttl) = self.fetch_keys().await?;
            debug!(key_count = keys.len(), ?ttl, "signing key cache refreshed");
            cache.keys = keys;
            cache.expires_at = Instant::now() + ttl;
        }

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| IdentityError::UnknownKeyId(kid.to_string()))
    }

    async fn fetch_keys(
        &self,
    ) -> std::result::Result<(HashMap<String, DecodingKey>, Duration), IdentityError> {
        let response = self
            .client
            .get(&self.certs_url)
            .send()
            .await
            .map_err(|e| IdentityError::CertsFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::CertsFetch(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_cache_max_age)
            .unwrap_or(DEFAULT_CERTS_CACHE_TTL);

        let cert_map: HashMap<String, String> = response
            .json()
            .await
            .map_err(|e| IdentityError::CertsFetch(format!("decode certs body: {e}")))?;
        if cert_map.is_empty() {
            return Err(IdentityError::CertsFetch("empty certs response".to_string()));
        }

        let mut keys = HashMap::with_capacity(cert_map.len());
        for (kid, cert_pem) in cert_map {
            let decoding_key = decoding_key_from_pem(&cert_pem)
                .map_err(|e| IdentityError::CertsFetch(format!("parse cert {kid}: {e}")))?;
            keys.insert(kid, decoding_key);
        }
        Ok((keys, ttl))
    }
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> IdentityError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => IdentityError::Expired,
        ErrorKind::InvalidSignature => IdentityError::InvalidSignature,
        ErrorKind::InvalidAudience => IdentityError::WrongAudience,
        ErrorKind::InvalidIssuer => IdentityError::WrongIssuer,
        _ => IdentityError::Malformed,
    }
}

/// Parse `max-age=N` out of a `Cache-Control` header value.
fn parse_cache_max_age(cache_control: &str) -> Option<Duration> {
    for directive in cache_control.split(',') {
        let trimmed = directive.trim();
        if let Some(seconds) = trimmed.strip_prefix("max-age=") {
            return match seconds.parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => None,
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIDATCCAemgAwIBAgIUHhRGwB41i4SFt/9zbS67tQ2RQkowDQYJKoZIhvcNAQEL
BQAwDzENMAsGA1UEAwwEdGVzdDAgFw0yNjA4MDIwNzM5MDlaGA8yMTI2MDcwOTA3
MzkwOVowDzENMAsGA1UEAwwEdGVzdDCCASIwDQYJKoZIhvcNAQEBBQADggEPADCC
AQoCggEBAKYPMbkkevpdpEjxtapOpsckg8mEHXBt7rrxes7O1JDTaixjhqH4c6uL
iZshv8E0zg+i5JaYre9hWIWGlDSiSd8/REWpnbvEYE5zo18q3NYIpYAUcuYC3jD4
96BK4YkeojBrkS9BlWiYp/NGeFBNIBuPO1sZ2a+Lo1GwUq+b9mc3GnvEWTi9FIm5
9YR/7XHAFQnnuVNta9ppPGvxE0h69JQiZQ88vhM7Y0L9aaPz6HITr+KWmZFbR6jQ
yqkS2uXvro7vwLiNYPqwtOuPTDupS+cDOhwiH/hZ2wYTSsrsAa8jLHUkVm+0lR+s
QID05hoVciYjDKluOEhooiEBjWLRNCMCAwEAAaNTMFEwHQYDVR0OBBYEFLCM3KfS
BT98hJEh+2Z4EUWDF9O1MB8GA1UdIwQYMBaAFLCM3KfSBT98hJEh+2Z4EUWDF9O1
MA8GA1UdEwEB/wQFMAMBAf8wDQYJKoZIhvcNAQELBQADggEBAG/qnK+PR+IG6tOR
oCSUBPx4z/fQL7OjemiTeqlx41q8KfsutCPT/wrjCqIu2fnYPzQYz8GX9DEyx3Hn
aDKP2elrJ+mAuZ6q2+M+vVuBvDoXHUr8xs2WqTh0OSaeuvHtfEW2FFislwEb+L99
9PpVfH1gzxA3r5m2m56Eju39uyfAWEuT1JhDEWgYqTJZF+yh+Gc5GfAFlGi7kzjO
iih3m6FRY4h0Y9tVupjWFj+yrXvhD5dPQ2TXp/qmP3TppcPcDQFsVJwdDk+GJYa1
yBNlsh/quFP3+cMIyCgEDF+66f4QNfvdQJCdgz5gcYnbcabuOePw7SsfyiBpSC/X
+gNp91s=
-----END CERTIFICATE-----
";

    const TEST_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEApg8xuSR6+l2kSPG1qk6m
xySDyYQdcG3uuvF6zs7UkNNqLGOGofhzq4uJmyG/wTTOD6Lklpit72FYhYaUNKJJ
3z9ERamdu8RgTnOjXyrc1gilgBRy5gLeMPj3oErhiR6iMGuRL0GVaJin80Z4UE0g
G487WxnZr4ujUbBSr5v2Zzcae8RZOL0Uibn1hH/tccAVCee5U21r2mk8a/ETSHr0
lCJlDzy+EztjQv1po/PochOv4paZkVtHqNDKqRLa5e+uju/AuI1g+rC0649MO6lL
5wM6HCIf+FnbBhNKyuwBryMsdSRWb7SVH6xAgPTmGhVyJiMMqW44SGiiIQGNYtE0
IwIDAQAB
-----END PUBLIC KEY-----
";

    #[test]
    fn test_decoding_key_from_certificate_pem() {
        assert!(decoding_key_from_pem(TEST_CERT_PEM).is_ok());
    }

    #[test]
    fn test_decoding_key_from_public_key_pem() {
        assert!(decoding_key_from_pem(TEST_PUBLIC_KEY_PEM).is_ok());
    }

    #[test]
    fn test_decoding_key_rejects_garbage() {
        assert!(decoding_key_from_pem("not a pem").is_err());
        assert!(decoding_key_from_pem("-----BEGIN CERTIFICATE-----\nZm9v\n-----END CERTIFICATE-----\n").is_err());
    }

    #[test]
    fn test_parse_cache_max_age() {
        assert_eq!(
            parse_cache_max_age("public, max-age=21600, must-revalidate"),
            Some(Duration::from_secs(21600))
        );
        assert_eq!(parse_cache_max_age("max-age=0"), None);
        assert_eq!(parse_cache_max_age("no-store"), None);
        assert_eq!(parse_cache_max_age(""), None);
    }

    #[test]
    fn test_issuer_is_derived_from_project() {
        let verifier = IdentityVerifier::new(
            "proj-1",
            "https://securetoken.example.com",
            "https://certs.example.com/keys",
        )
        .unwrap();
        assert_eq!(verifier.issuer, "https://securetoken.example.com/proj-1");
    }

    #[test]
    fn test_empty_project_is_rejected() {
        assert!(IdentityVerifier::new("", "https://i", "https://c").is_err());
    }

    #[tokio::test]
    async fn test_garbage_token_is_rejected() {
        let verifier = IdentityVerifier::new(
            "proj-1",
            "https://securetoken.example.com",
            "https://certs.invalid/keys",
        )
        .unwrap();
        let err = verifier.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_non_rs256_token_is_rejected_before_key_lookup() {
        // HS256-signed token: must be rejected on algorithm, not on certs fetch.
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &serde_json::json!({ "sub": "u", "exp": 4102444800i64, "iat": 0 }),
            &jsonwebtoken::EncodingKey::from_secret(b"k"),
        )
        .unwrap();

        let verifier = IdentityVerifier::new(
            "proj-1",
            "https://securetoken.example.com",
            "https://certs.invalid/keys",
        )
        .unwrap();
        let err = verifier.verify_inner(&token).await.unwrap_err();
        assert!(matches!(err, IdentityError::WrongAlgorithm));
    }
}
