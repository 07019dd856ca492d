//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// In-process counters.
pub mod metrics;

pub use metrics::{Counter, Metrics, MetricsSnapshot};

/// Log target for audit trail entries (unknown job ids, late callbacks).
pub const AUDIT_TARGET: &str = "audit";

/// Log target for security events (tenant mismatch, failed webhook auth).
pub const SECURITY_TARGET: &str = "security";
