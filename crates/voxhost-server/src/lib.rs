//! Voxhost server library logic.

pub mod background;
pub mod config;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use config::InstanceConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use voxhost_deploy::{DeploymentOrchestrator, InstanceSummary, TemplateRegistry};
use voxhost_types::ProviderTemplate;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The single orchestrator owning every provider instance.
    pub orchestrator: Arc<DeploymentOrchestrator>,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Handler for `GET /instances`.
async fn list_instances_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<InstanceSummary>> {
    Json(state.orchestrator.list_instances().await)
}

/// Handler for `GET /instances/{providerId}`.
async fn get_instance_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider_id): Path<String>,
) -> Result<Json<InstanceSummary>, ApiError> {
    let handle = state
        .orchestrator
        .get_instance(&provider_id)
        .ok_or_else(|| ApiError::NotFound(format!("no instance {}", provider_id)))?;
    Ok(Json(handle.summary().await))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instances", get(list_instances_handler))
        .route("/instances/{providerId}", get(get_instance_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

/// The built-in catalog extended by configured templates.
pub fn build_registry(templates: &[ProviderTemplate]) -> TemplateRegistry {
    let mut registry = TemplateRegistry::builtin();
    for template in templates {
        let provider_type = template.provider_type.clone();
        if registry.register(template.clone()).is_some() {
            tracing::info!(provider_type = %provider_type, "configured template replaces built-in");
        } else {
            tracing::info!(provider_type = %provider_type, "registered configured template");
        }
    }
    registry
}

/// Creates and starts every configured instance in order.
///
/// Failures are logged and skipped so one broken provider does not keep
/// the others down. Returns the number of instances that started.
pub async fn boot_instances(orchestrator: &DeploymentOrchestrator, instances: &[InstanceConfig]) -> usize {
    let mut started = 0;
    for instance in instances {
        let created = orchestrator.create_provider_instance(
            &instance.id,
            &instance.provider_type,
            instance.overrides.clone(),
        );
        if let Err(e) = created {
            tracing::error!(provider_id = %instance.id, provider_type = %instance.provider_type, error = %e, "failed to create instance");
            continue;
        }
        match orchestrator.start_instance(&instance.id).await {
            Ok(handle) => {
                tracing::info!(provider_id = %instance.id, handle = %handle, "instance started");
                started += 1;
            }
            Err(e) => {
                tracing::error!(provider_id = %instance.id, error = %e, "failed to start instance");
            }
        }
    }
    started
}
