//! Request signature guard for run-initiating requests.
//!
//! A client signs `"<epoch millis>:<last message content>"` with HMAC-SHA256
//! keyed by the shared secret and sends the lowercase hex digest as `sign`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::AuthError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIGNATURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Compute the signature a client attaches to a generate request.
#[must_use]
pub fn generate_signature(secret: &str, timestamp_ms: i64, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(signed_payload(timestamp_ms, message).as_bytes());
    encode_hex(&mac.finalize().into_bytes())
}

fn signed_payload(timestamp_ms: i64, message: &str) -> String {
    format!("{timestamp_ms}:{message}")
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.len().is_multiple_of(2) {
        return None;
    }
    (0..trimmed.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(trimmed.get(index..index + 2)?, 16).ok())
        .collect()
}

/// Verifies site password, freshness, and signature of inbound requests.
#[derive(Debug, Clone)]
pub struct SignatureGuard {
    secret: Option<String>,
    site_password: Option<String>,
    window: Duration,
}

impl SignatureGuard {
    #[must_use]
    pub fn new(secret: Option<String>, site_password: Option<String>, window: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            site_password: site_password.filter(|p| !p.is_empty()),
            window,
        }
    }

    /// Whether requests are actually signed-checked.
    #[must_use]
    pub fn enforces_signature(&self) -> bool {
        self.secret.is_some()
    }

    /// Check one request against the clock `now_ms` (epoch millis).
    pub fn verify(
        &self,
        timestamp_ms: i64,
        last_message: &str,
        signature: &str,
        password: Option<&str>,
        now_ms: i64,
    ) -> Result<(), AuthError> {
        if let Some(expected) = self.site_password.as_deref()
            && password != Some(expected)
        {
            return Err(AuthError::InvalidPassword);
        }

        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };

        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        let age_ms = now_ms.saturating_sub(timestamp_ms);
        if age_ms > window_ms {
            return Err(AuthError::Expired {
                age: Duration::from_millis(u64::try_from(age_ms).unwrap_or(u64::MAX)),
                window: self.window,
            });
        }
        if age_ms < -window_ms {
            return Err(AuthError::FromFuture);
        }

        if signature.trim().is_empty() {
            return Err(AuthError::MissingSignature);
        }
        let provided = decode_hex(signature).ok_or(AuthError::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AuthError::InvalidSignature)?;
        mac.update(signed_payload(timestamp_ms, last_message).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn guard() -> SignatureGuard {
        SignatureGuard::new(Some("s3cret".into()), None, DEFAULT_SIGNATURE_WINDOW)
    }

    #[test]
    fn accepts_fresh_valid_signature() {
        let sign = generate_signature("s3cret", NOW - 1_000, "hello");
        assert_eq!(sign.len(), 64);
        assert_eq!(guard().verify(NOW - 1_000, "hello", &sign, None, NOW), Ok(()));
    }

    #[test]
    fn rejects_signature_over_other_message() {
        let sign = generate_signature("s3cret", NOW, "hello");
        assert_eq!(
            guard().verify(NOW, "goodbye", &sign, None, NOW),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_signature_with_wrong_secret() {
        let sign = generate_signature("other", NOW, "hello");
        assert_eq!(
            guard().verify(NOW, "hello", &sign, None, NOW),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_stale_and_future_requests() {
        let stale = NOW - 10 * 60 * 1000;
        let sign = generate_signature("s3cret", stale, "hello");
        assert!(matches!(
            guard().verify(stale, "hello", &sign, None, NOW),
            Err(AuthError::Expired { .. })
        ));

        let future = NOW + 10 * 60 * 1000;
        let sign = generate_signature("s3cret", future, "hello");
        assert_eq!(
            guard().verify(future, "hello", &sign, None, NOW),
            Err(AuthError::FromFuture)
        );
    }

    #[test]
    fn rejects_missing_or_garbled_signature() {
        assert_eq!(
            guard().verify(NOW, "hello", "", None, NOW),
            Err(AuthError::MissingSignature)
        );
        assert_eq!(
            guard().verify(NOW, "hello", "zz", None, NOW),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn site_password_is_checked_first() {
        let guard = SignatureGuard::new(
            Some("s3cret".into()),
            Some("letmein".into()),
            DEFAULT_SIGNATURE_WINDOW,
        );
        let sign = generate_signature("s3cret", NOW, "hello");
        assert_eq!(
            guard.verify(NOW, "hello", &sign, Some("nope"), NOW),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            guard.verify(NOW, "hello", &sign, Some("letmein"), NOW),
            Ok(())
        );
    }

    #[test]
    fn no_secret_disables_signature_check() {
        let guard = SignatureGuard::new(None, None, DEFAULT_SIGNATURE_WINDOW);
        assert!(!guard.enforces_signature());
        assert_eq!(guard.verify(0, "hello", "", None, NOW), Ok(()));
    }
}
