//! Rise Ingress API
//!
//! The HTTP surface that accepts uploaded site bundles and reports
//! deployment state. Uploads are streamed to private object storage, a
//! deployment row is recorded in `pending_deploy`, and a deploy job is
//! queued for the worker. Authentication is the platform gateway's job;
//! this service trusts the identity it forwards.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use rise_deployer::DeploymentStore;
use rise_state::MessageBus;
use rise_store::FileTransfer;

pub use auth::CurrentUser;
pub use config::ApiConfig;
pub use error::ApiError;

/// Shared application state for the ingress service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment persistence.
    pub store: Arc<dyn DeploymentStore>,
    /// Object storage client.
    pub transfer: Arc<dyn FileTransfer>,
    /// Job queue.
    pub bus: Arc<dyn MessageBus>,
    /// Service configuration.
    pub config: Arc<ApiConfig>,
}

/// Creates the API router.
///
/// The multipart handler enforces the upload limit itself so it can
/// answer with the platform's error envelope; the default body limit is
/// disabled in its favour.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/projects/{name}/deployments",
            post(handlers::deployments::create_deployment),
        )
        .route(
            "/projects/{name}/deployments/{id}",
            get(handlers::deployments::get_deployment),
        )
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "healthy" })
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}
