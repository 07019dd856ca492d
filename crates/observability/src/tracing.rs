//! Tracing/logging initialization.
//!
//! JSON lines, filtered via `RUST_LOG`. Audit and security entries are
//! ordinary events on the `audit` / `security` targets, so they can be
//! routed with a filter such as `RUST_LOG=info,security=warn`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], with a caller-provided fallback filter when `RUST_LOG` is unset.
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Targets stay on: they carry the audit/security distinction.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
