//! Request authentication headers.
//!
//! Every request carries the shared secret, the send time, and a SHA-256 of
//! the request body. The client refuses to build headers without a secret;
//! the server checks all three.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::ErrorKind;

pub const HEADER_SECRET: &str = "X-Relay-Secret";
pub const HEADER_TIMESTAMP: &str = "X-Relay-Timestamp";
pub const HEADER_PAYLOAD_HASH: &str = "X-Relay-Payload-Hash";

/// Default tolerated clock difference between client and server
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("Shared secret is not configured; refusing to send unauthenticated requests")]
    MissingSecret,

    #[error("Missing security header: {0}")]
    MissingHeader(&'static str),

    #[error("Shared secret does not match")]
    BadSecret,

    #[error("Malformed timestamp header: {0}")]
    MalformedTimestamp(String),

    #[error("Request timestamp is stale: {skew_secs}s off server time")]
    StaleTimestamp { skew_secs: i64 },

    #[error("Payload hash does not match request body")]
    HashMismatch,
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SecurityRejected
    }
}

/// SHA-256 of `body`, hex encoded
pub fn payload_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// The three authentication headers of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHeaders {
    pub secret: String,
    pub timestamp: i64,
    pub payload_hash: String,
}

impl SecurityHeaders {
    /// Build headers for `body`; an empty secret is a configuration error
    pub fn sign(secret: &str, body: &[u8], now_secs: i64) -> Result<Self, SecurityError> {
        if secret.trim().is_empty() {
            return Err(SecurityError::MissingSecret);
        }
        Ok(Self {
            secret: secret.to_string(),
            timestamp: now_secs,
            payload_hash: payload_hash(body),
        })
    }

    /// Header name/value pairs in wire order
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_SECRET, self.secret.clone()),
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_PAYLOAD_HASH, self.payload_hash.clone()),
        ]
    }

    /// Parse headers through a case-insensitive lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SecurityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup(HEADER_SECRET).ok_or(SecurityError::MissingHeader(HEADER_SECRET))?;
        let raw_ts =
            lookup(HEADER_TIMESTAMP).ok_or(SecurityError::MissingHeader(HEADER_TIMESTAMP))?;
        let payload_hash = lookup(HEADER_PAYLOAD_HASH)
            .ok_or(SecurityError::MissingHeader(HEADER_PAYLOAD_HASH))?;

        let timestamp = raw_ts
            .trim()
            .parse::<i64>()
            .map_err(|_| SecurityError::MalformedTimestamp(raw_ts.clone()))?;

        Ok(Self {
            secret,
            timestamp,
            payload_hash,
        })
    }
}

/// Server-side check of incoming headers
#[derive(Debug, Clone)]
pub struct RequestVerifier {
    secret: String,
    max_skew_secs: i64,
}

impl RequestVerifier {
    pub fn new(secret: impl Into<String>, max_skew_secs: i64) -> Result<Self, SecurityError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(SecurityError::MissingSecret);
        }
        Ok(Self {
            secret,
            max_skew_secs,
        })
    }

    pub fn verify(
        &self,
        headers: &SecurityHeaders,
        body: &[u8],
        now_secs: i64,
    ) -> Result<(), SecurityError> {
        if !constant_time_eq(headers.secret.as_bytes(), self.secret.as_bytes()) {
            return Err(SecurityError::BadSecret);
        }

        let skew = now_secs - headers.timestamp;
        if skew.abs() > self.max_skew_secs {
            return Err(SecurityError::StaleTimestamp { skew_secs: skew });
        }

        let expected = payload_hash(body);
        if !constant_time_eq(
            headers.payload_hash.to_ascii_lowercase().as_bytes(),
            expected.as_bytes(),
        ) {
            return Err(SecurityError::HashMismatch);
        }

        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_refused() {
        assert_eq!(
            SecurityHeaders::sign("", b"body", 0),
            Err(SecurityError::MissingSecret)
        );
        assert_eq!(
            SecurityHeaders::sign("   ", b"body", 0),
            Err(SecurityError::MissingSecret)
        );
    }

    #[test]
    fn test_signed_headers_verify() {
        let verifier = RequestVerifier::new("s3cret", 60).unwrap();
        let headers = SecurityHeaders::sign("s3cret", b"chunk", 1_000).unwrap();

        assert!(verifier.verify(&headers, b"chunk", 1_030).is_ok());
        assert_eq!(
            verifier.verify(&headers, b"other", 1_030),
            Err(SecurityError::HashMismatch)
        );
        assert!(matches!(
            verifier.verify(&headers, b"chunk", 2_000),
            Err(SecurityError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = RequestVerifier::new("s3cret", 60).unwrap();
        let headers = SecurityHeaders::sign("guess", b"", 10).unwrap();
        assert_eq!(
            verifier.verify(&headers, b"", 10),
            Err(SecurityError::BadSecret)
        );
    }

    #[test]
    fn test_parse_from_lookup() {
        let signed = SecurityHeaders::sign("k", b"x", 42).unwrap();
        let pairs = signed.pairs();
        let parsed = SecurityHeaders::from_lookup(|name| {
            pairs
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        })
        .unwrap();
        assert_eq!(parsed, signed);

        let malformed = SecurityHeaders::from_lookup(|name| match name {
            HEADER_TIMESTAMP => Some("yesterday".to_string()),
            _ => Some("x".to_string()),
        });
        assert!(matches!(malformed, Err(SecurityError::MalformedTimestamp(_))));
    }
}
