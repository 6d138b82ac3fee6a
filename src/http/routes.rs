//! Axum router configuration

use axum::{
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{
    cache_file, cache_stats, create_session, end_session, health_check, session_stats,
    transmux_full, transmux_start, version_check,
};
use super::proxy::{proxy_key, proxy_playlist, proxy_segment};

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        // Health and version endpoints
        .route("/health", get(health_check))
        .route("/version", get(version_check))
        // Debug endpoints
        .route("/debug/cache", get(cache_stats))
        .route("/debug/sessions", get(session_stats))
        // Proxy sessions
        .route("/session", post(create_session))
        .route("/session/{token}", delete(end_session))
        // Upstream proxy
        .route("/proxy/playlist", get(proxy_playlist))
        .route("/proxy/segment", get(proxy_segment))
        .route("/proxy/key", get(proxy_key))
        // Transmux
        .route("/transmux/start", post(transmux_start))
        .route("/transmux/full", post(transmux_full))
        .route("/cache/{key}/{file}", get(cache_file))
        .layer(TraceLayer::new_for_http());

    let router = if state.config.server.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    };

    router.with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS, Method::HEAD])
        .allow_headers([
            header::ACCEPT,
            header::RANGE,
            header::CONTENT_TYPE,
            header::ORIGIN,
        ])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::HeaderName::from_static(super::proxy::UPSTREAM_STATUS_HEADER),
            header::HeaderName::from_static(super::proxy::UPSTREAM_URL_HEADER),
        ])
        .allow_private_network(true)
        .max_age(Duration::from_secs(3600))
}
