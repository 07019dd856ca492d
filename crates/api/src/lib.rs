//! HTTP API: webhook intake, job submission and status queries, process wiring.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;

pub use config::AppConfig;
