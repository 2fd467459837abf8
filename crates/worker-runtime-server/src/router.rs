//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use worker_runtime_core::EntryPoint;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{handle_request, health_check, readiness_check};
use crate::state::AppState;

/// Admin API configuration for router.
#[derive(Debug, Clone)]
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Build the main application router.
///
/// Routes:
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - anything else - Dispatched to the worker pool
pub fn build_router<E: EntryPoint>(state: AppState<E>, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional Admin API.
///
/// # Arguments
///
/// * `state` - Application state
/// * `request_timeout` - Request timeout duration
/// * `admin_config` - Optional Admin API configuration
pub fn build_router_with_admin<E: EntryPoint>(
    state: AppState<E>,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check::<E>));

    let mut router = Router::new()
        .merge(health_routes)
        .fallback(handle_request::<E>);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        let admin_router = build_admin_router(admin_state);
        router = router.nest(&config.prefix, admin_router);
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
