pub mod handler;
pub mod middleware;
pub mod streaming;

use arc_swap::ArcSwap;
use axum::{Router, middleware as axum_mw};
use ccproxy_core::config::Config;
use ccproxy_provider::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub pipeline: Arc<Pipeline>,
    pub start_time: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.load().performance.max_request_body_size;

    // Liveness and readiness — no auth required.
    let public_routes = Router::new()
        .route("/health", axum::routing::get(handler::health::health))
        .route("/status", axum::routing::get(handler::health::status));

    // Translation endpoint — auth required, body size capped.
    let api_routes = Router::new()
        .route(
            "/v1/messages",
            axum::routing::post(handler::messages::messages),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(axum_mw::from_fn(
            middleware::request_logging::request_logging_middleware,
        ))
        .layer(axum_mw::from_fn(
            middleware::request_context::request_context_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
