use std::sync::Arc;

use axum::routing::{any, post};
use axum::Router;

use crate::auth::AuthGate;
use crate::proxy::engine::ProxyEngine;
use crate::surface::handlers::{login_handler, logout_handler, proxy_handler};
use crate::surface::logging::detailed_logging_middleware;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub auth: Arc<AuthGate>,
    pub production: bool,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1beta/{*path}", any(proxy_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .layer(axum::middleware::from_fn(detailed_logging_middleware))
        .layer(cors_layer())
        .with_state(state)
}

/// Allows any origin/method/header: this proxy fronts a public generative-AI
/// API and clients are authenticated by access key, not by origin.
fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
