use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use inferlink_api::app::{build_app, services::AppServices};
use inferlink_api::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inferlink_observability::init();

    let config = AppConfig::from_env()?;
    info!(config = ?config, "configuration loaded");

    let services = Arc::new(AppServices::build(&config)?);
    services.spawn_event_logger()?;
    let workers = services.spawn_workers();

    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for worker in workers {
        let name = worker.name();
        worker.shutdown().await;
        info!(worker = name, "worker stopped");
    }

    match Arc::try_unwrap(services) {
        Ok(services) => services.supervisor.shutdown().await,
        Err(_) => warn!("services still shared at shutdown; in-flight submissions not awaited"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
