//! HTTP server assembly.

use std::future::Future;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes::{
    create_job, delete_job, get_job, health_check, job_history, list_jobs, pause_job, resume_job,
    AppState,
};
use crate::error::SchedulerError;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

/// Build the router with all routes and middleware.
pub fn router(config: &HttpConfig, state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/jobs/:id/pause", patch(pause_job))
        .route("/api/jobs/:id/resume", patch(resume_job))
        .route("/api/jobs/:id/history", get(job_history))
        .route("/health", get(health_check))
        .with_state(state);

    if config.enable_tracing {
        router = router.layer(TraceLayer::new_for_http());
    }
    if config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: &HttpConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), SchedulerError> {
    let app = router(config, state);
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SchedulerError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!("http server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SchedulerError::Internal(format!("server error: {e}")))
}
