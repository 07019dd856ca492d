//! HMAC-SHA256 webhook signature verification with a replay window.
//!
//! Checks run in a fixed order and all of them finish before the body is
//! parsed: credentials present, timestamp fresh, signature valid. The signed
//! message is `"{timestamp}:{raw body}"`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use inferlink_observability::SECURITY_TARGET;

type HmacSha256 = Hmac<Sha256>;

/// Default allowed clock skew between sender and verifier.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookAuthError {
    #[error("missing signature or timestamp")]
    MissingCredentials,

    #[error("request timestamp outside the freshness window")]
    StaleRequest,

    #[error("signature mismatch")]
    InvalidSignature,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthConfigError {
    #[error("a webhook secret is required in production")]
    SecretRequiredInProduction,

    #[error("webhook secret must not be empty")]
    EmptySecret,
}

/// Authenticator configuration, fixed at construction.
#[derive(Clone)]
pub struct AuthenticatorConfig {
    pub secret: Option<String>,
    pub freshness_window: Duration,
    pub production: bool,
}

impl AuthenticatorConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            production: false,
        }
    }

    /// No secret: every request passes, loudly. Refused in production.
    pub fn unauthenticated() -> Self {
        Self {
            secret: None,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            production: false,
        }
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }
}

impl core::fmt::Debug for AuthenticatorConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthenticatorConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("freshness_window", &self.freshness_window)
            .field("production", &self.production)
            .finish()
    }
}

/// How a request got through.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// Signature and timestamp checked against the shared secret.
    Verified,
    /// No secret configured (development only).
    Unverified,
}

#[derive(Clone)]
pub struct WebhookAuthenticator {
    secret: Option<Vec<u8>>,
    freshness_window: chrono::Duration,
}

impl core::fmt::Debug for WebhookAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebhookAuthenticator")
            .field("configured", &self.secret.is_some())
            .field("freshness_window", &self.freshness_window)
            .finish()
    }
}

impl WebhookAuthenticator {
    pub fn new(config: AuthenticatorConfig) -> Result<Self, AuthConfigError> {
        let secret = match config.secret {
            Some(s) if s.is_empty() => return Err(AuthConfigError::EmptySecret),
            Some(s) => Some(s.into_bytes()),
            None if config.production => return Err(AuthConfigError::SecretRequiredInProduction),
            None => {
                warn!(
                    target: SECURITY_TARGET,
                    "webhook authenticator constructed without a secret; all callbacks will be accepted"
                );
                None
            }
        };

        let freshness_window =
            chrono::Duration::from_std(config.freshness_window).unwrap_or(chrono::Duration::MAX);

        Ok(Self {
            secret,
            freshness_window,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify a callback. Must be called before the body is parsed.
    pub fn verify(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Authentication, WebhookAuthError> {
        let Some(secret) = self.secret.as_deref() else {
            warn!(
                target: SECURITY_TARGET,
                "webhook accepted without signature verification (no secret configured)"
            );
            return Ok(Authentication::Unverified);
        };

        // 1. presence
        let signature = signature.map(str::trim).filter(|s| !s.is_empty());
        let timestamp = timestamp.map(str::trim).filter(|s| !s.is_empty());
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return Err(WebhookAuthError::MissingCredentials);
        };

        // 2. freshness
        let sent_at = timestamp
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or(WebhookAuthError::StaleRequest)?;
        let skew = (now - sent_at).abs();
        if skew > self.freshness_window {
            return Err(WebhookAuthError::StaleRequest);
        }

        // 3. signature (constant-time compare inside verify_slice)
        let claimed = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
        let claimed = hex::decode(claimed).map_err(|_| WebhookAuthError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookAuthError::InvalidSignature)?;
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(raw_body);
        mac.verify_slice(&claimed)
            .map_err(|_| WebhookAuthError::InvalidSignature)?;

        Ok(Authentication::Verified)
    }
}

/// Compute the hex signature a sender attaches for `(timestamp, body)`.
pub fn sign(secret: &[u8], timestamp: &str, raw_body: &[u8]) -> Result<String, WebhookAuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookAuthError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &str = "whsec_test";

    fn authenticator() -> WebhookAuthenticator {
        WebhookAuthenticator::new(AuthenticatorConfig::with_secret(SECRET)).unwrap()
    }

    fn signed(now: DateTime<Utc>, body: &[u8]) -> (String, String) {
        let ts = now.timestamp().to_string();
        let sig = sign(SECRET.as_bytes(), &ts, body).unwrap();
        (sig, ts)
    }

    #[test]
    fn valid_request_is_verified() {
        let now = Utc::now();
        let body = br#"{"externalJobId":"x"}"#;
        let (sig, ts) = signed(now, body);

        let res = authenticator().verify(body, Some(&sig), Some(&ts), now);
        assert_eq!(res, Ok(Authentication::Verified));
    }

    #[test]
    fn prefixed_and_uppercase_signatures_are_accepted() {
        let now = Utc::now();
        let body = b"{}";
        let (sig, ts) = signed(now, body);
        let auth = authenticator();

        let prefixed = format!("sha256={sig}");
        assert!(auth.verify(body, Some(&prefixed), Some(&ts), now).is_ok());
        assert!(auth.verify(body, Some(&sig.to_uppercase()), Some(&ts), now).is_ok());
    }

    #[test]
    fn missing_fields_are_reported_first() {
        let now = Utc::now();
        let auth = authenticator();

        assert_eq!(auth.verify(b"{}", None, Some("1"), now), Err(WebhookAuthError::MissingCredentials));
        assert_eq!(auth.verify(b"{}", Some("ab"), None, now), Err(WebhookAuthError::MissingCredentials));
        assert_eq!(auth.verify(b"{}", Some("  "), Some("1"), now), Err(WebhookAuthError::MissingCredentials));
    }

    #[test]
    fn ten_minute_old_timestamp_is_stale() {
        let now = Utc::now();
        let sent = now - chrono::Duration::minutes(10);
        let body = b"{}";
        let (sig, ts) = signed(sent, body);

        assert_eq!(authenticator().verify(body, Some(&sig), Some(&ts), now), Err(WebhookAuthError::StaleRequest));
    }

    #[test]
    fn future_timestamp_beyond_window_is_stale() {
        let now = Utc::now();
        let sent = now + chrono::Duration::minutes(6);
        let (sig, ts) = signed(sent, b"{}");

        assert_eq!(authenticator().verify(b"{}", Some(&sig), Some(&ts), now), Err(WebhookAuthError::StaleRequest));
    }

    #[test]
    fn garbage_timestamp_is_stale() {
        let now = Utc::now();
        assert_eq!(
            authenticator().verify(b"{}", Some("00"), Some("yesterday"), now),
            Err(WebhookAuthError::StaleRequest)
        );
    }

    #[test]
    fn stale_check_runs_before_signature_check() {
        let now = Utc::now();
        let old = (now - chrono::Duration::hours(1)).timestamp().to_string();
        assert_eq!(
            authenticator().verify(b"{}", Some("not-hex"), Some(&old), now),
            Err(WebhookAuthError::StaleRequest)
        );
    }

    #[test]
    fn tampered_body_fails_signature() {
        let now = Utc::now();
        let (sig, ts) = signed(now, br#"{"status":"failed"}"#);

        assert_eq!(
            authenticator().verify(br#"{"status":"completed"}"#, Some(&sig), Some(&ts), now),
            Err(WebhookAuthError::InvalidSignature)
        );
    }

    #[test]
    fn signature_is_bound_to_timestamp() {
        let now = Utc::now();
        let body = b"{}";
        let (sig, _) = signed(now, body);
        let other_ts = (now.timestamp() - 1).to_string();

        assert_eq!(
            authenticator().verify(body, Some(&sig), Some(&other_ts), now),
            Err(WebhookAuthError::InvalidSignature)
        );
    }

    #[test]
    fn no_secret_is_a_noop_outside_production() {
        let auth = WebhookAuthenticator::new(AuthenticatorConfig::unauthenticated()).unwrap();
        assert!(!auth.is_configured());
        assert_eq!(auth.verify(b"{}", None, None, Utc::now()), Ok(Authentication::Unverified));
    }

    #[test]
    fn no_secret_is_refused_in_production() {
        let res = WebhookAuthenticator::new(AuthenticatorConfig::unauthenticated().production(true));
        assert_eq!(res.err(), Some(AuthConfigError::SecretRequiredInProduction));

        let res = WebhookAuthenticator::new(AuthenticatorConfig::with_secret(""));
        assert_eq!(res.err(), Some(AuthConfigError::EmptySecret));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let rendered = format!("{:?}", AuthenticatorConfig::with_secret(SECRET));
        assert!(!rendered.contains(SECRET));
    }

    proptest! {
        #[test]
        fn verified_iff_fresh_and_untampered(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            offset_secs in -900i64..900,
            tamper in any::<bool>(),
        ) {
            let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
            let sent = now + chrono::Duration::seconds(offset_secs);
            let ts = sent.timestamp().to_string();
            let mut sig = sign(SECRET.as_bytes(), &ts, &body).unwrap();
            if tamper {
                // flip the last hex digit
                let last = sig.pop().unwrap();
                sig.push(if last == '0' { '1' } else { '0' });
            }

            let res = authenticator().verify(&body, Some(&sig), Some(&ts), now);
            let fresh = offset_secs.abs() <= 300;
            prop_assert_eq!(res.is_ok(), fresh && !tamper);
        }
    }
}
