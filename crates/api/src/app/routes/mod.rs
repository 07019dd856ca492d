use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;
pub mod webhook;

/// Routes that authenticate themselves (health, metrics, signed webhooks).
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/webhook", post(webhook::receive))
}

/// Router for tenant-scoped endpoints; needs the tenant middleware in front.
pub fn tenant_router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}
