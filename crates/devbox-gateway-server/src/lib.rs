//! HTTP and WebSocket gateway over the devbox orchestrator.

pub mod handlers;
pub mod streaming;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use devbox_orchestrator::Orchestrator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::ApiError;
pub use types::ApiResponse;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Connected live-channel observers.
    pub observers: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            observers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Relaxed)
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/profiles", get(handlers::list_profiles))
        // Containers
        .route(
            "/api/containers",
            get(handlers::list_containers).post(handlers::create_container),
        )
        .route(
            "/api/containers/:id",
            get(handlers::container_info).delete(handlers::destroy_container),
        )
        .route("/api/containers/:id/start", post(handlers::start_container))
        .route("/api/containers/:id/stop", post(handlers::stop_container))
        .route("/api/containers/:id/restart", post(handlers::restart_container))
        .route("/api/containers/:id/backup", post(handlers::backup_container))
        .route("/api/containers/:id/backups", get(handlers::list_backups))
        .route("/api/containers/:id/template", post(handlers::apply_template))
        .route("/api/containers/:id/monitor", get(handlers::monitor_container))
        .route(
            "/api/containers/:id/configure-assistant",
            post(handlers::configure_assistant),
        )
        // Live updates
        .route("/ws", get(streaming::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
