use std::sync::Arc;

use axum::{middleware, routing::post, Router};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;

use config::Config;
use domain::DemoServerFactory;
use mcp::{server::ServerFactory, transport::TransportSettings};

/// Shared, immutable per-process state. Nothing protocol-related lives here:
/// each request builds its own server through `server_factory`.
#[derive(Clone)]
pub struct AppState {
    pub server_factory: Arc<dyn ServerFactory>,
    pub transport: TransportSettings,
}

impl AppState {
    pub fn new(server_factory: Arc<dyn ServerFactory>, transport: TransportSettings) -> Self {
        Self {
            server_factory,
            transport,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(DemoServerFactory), TransportSettings::from(config))
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(http::handlers::mcp_endpoint)
                .get(http::handlers::method_not_allowed)
                .delete(http::handlers::method_not_allowed),
        )
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
