//! Operator-facing HTTP API
//!
//! Configuration ingress, the endpoint directory, liveness queries, and
//! session listings, served over plain HTTP on a port separate from the
//! control listener. OpenAPI documentation is generated from the handlers
//! and served through Swagger UI at `/docs`.

pub mod handlers;
pub mod models;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use fleetlink_control::{
    AddressedDispatcher, ConfigDistributor, ControlHandler, IdentityDirectory, LivenessTracker,
    SessionRegistry,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub distributor: ConfigDistributor,
    pub dispatcher: AddressedDispatcher,
    pub directory: IdentityDirectory,
    pub liveness: LivenessTracker,
    pub handler: ControlHandler,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleetlink API",
        version = "0.1.0",
        description = "REST API for operating a fleetlink control plane",
        contact(
            name = "Fleetlink Team",
            email = "team@fleetlink.io"
        )
    ),
    paths(
        handlers::push_config,
        handlers::get_kind_config,
        handlers::get_endpoint_config,
        handlers::list_endpoints,
        handlers::get_endpoint,
        handlers::delete_endpoint,
        handlers::get_endpoint_liveness,
        handlers::list_sessions,
        handlers::health_check,
    ),
    components(
        schemas(
            models::ConfigOwner,
            models::PushConfigRequest,
            models::PushConfigResponse,
            models::CachedConfig,
            models::EndpointSummary,
            models::EndpointList,
            models::EndpointQuery,
            models::DeleteEndpointQuery,
            models::LivenessQuery,
            models::LivenessResponse,
            models::SessionSummary,
            models::SessionList,
            models::HealthResponse,
            models::ErrorResponse,
            fleetlink_proto::LivenessStatus,
        )
    ),
    tags(
        (name = "config", description = "Configuration distribution endpoints"),
        (name = "endpoints", description = "Endpoint directory endpoints"),
        (name = "sessions", description = "Connected session endpoints"),
        (name = "system", description = "System health endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS (for development tooling)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            enable_cors: true,
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let api_router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/api/config", post(handlers::push_config))
            .route("/api/config/kind/{kind}", get(handlers::get_kind_config))
            .route(
                "/api/config/endpoint/{id}",
                get(handlers::get_endpoint_config),
            )
            .route("/api/endpoints", get(handlers::list_endpoints))
            .route(
                "/api/endpoints/{id}",
                get(handlers::get_endpoint).delete(handlers::delete_endpoint),
            )
            .route(
                "/api/endpoints/{id}/liveness",
                get(handlers::get_endpoint_liveness),
            )
            .route("/api/sessions", get(handlers::list_sessions))
            .with_state(self.state.clone());

        // SwaggerUi also serves the spec itself at /api/openapi.json
        let router = Router::new()
            .merge(SwaggerUi::new("/docs").url("/api/openapi.json", api_doc))
            .merge(api_router);

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::DELETE])
                    .allow_headers([header::CONTENT_TYPE])
                    .allow_origin(Any),
            );
        }

        router
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/docs", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
