use devbox_gateway_server::{create_app, AppState};
use devbox_orchestrator::{DevboxConfig, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,devbox=debug")),
        )
        .init();

    let config = DevboxConfig::load()?;
    let orchestrator = Orchestrator::from_config(&config)?;

    match orchestrator.sync().await {
        Ok(containers) => info!(containers = containers.len(), "Initial sync complete"),
        Err(e) => warn!(error = %e, "Initial sync failed, monitoring will retry"),
    }
    let monitor = orchestrator.spawn_monitor();

    let app = create_app(AppState::new(orchestrator));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Devbox gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.abort();
    info!("Devbox gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
