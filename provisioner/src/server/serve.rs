//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ProvisionError;
use crate::server::handlers::{
    catalog_handler, events_handler, health_handler, instances_handler, progress_handler,
    provision_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the router without binding a socket
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Catalogs
        .route("/catalog", get(catalog_handler))
        // Instances
        .route("/instances", get(instances_handler))
        .route("/instances/{id}/provision", post(provision_handler))
        .route("/instances/{id}/provisioning", get(progress_handler))
        .route("/instances/{id}/provisioning/events", get(events_handler))
        // State and middleware
        .with_state(state)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Dashboards on other origins read progress and open event streams
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ProvisionError>>, ProvisionError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProvisionError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ProvisionError::ServerError(e.to_string()))
    });

    Ok(handle)
}
