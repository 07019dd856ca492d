//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job lifecycle, dispatcher, workers and their shared state
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Callback and job bodies above this size are refused before parsing.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    // Tenant-scoped routes: require a tenant context.
    let scoped = routes::tenant_router().route_layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .merge(routes::public_router())
        .merge(scoped)
        .layer(
            ServiceBuilder::new()
                .layer(Extension(services))
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
}
