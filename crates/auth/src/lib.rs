//! `inferlink-auth` — webhook caller authentication.
//!
//! Decoupled from HTTP: callers hand over the raw body bytes and the claimed
//! signature/timestamp header values exactly as received.

pub mod webhook;

pub use webhook::{
    AuthConfigError, Authentication, AuthenticatorConfig, WebhookAuthError, WebhookAuthenticator, sign,
};
