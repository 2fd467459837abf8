//! Admin API handlers for runtime management.
//!
//! This module provides HTTP handlers for the operator commands that reach
//! a running server: status, rolling reload, stop, and the bootstrap cache
//! and preload manifest facilities.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `GET /admin/status` - Pool status and per-worker snapshots
//! - `POST /admin/reload` - Rolling reload of every worker
//! - `POST /admin/stop` - Stop the pool and shut the server down
//! - `POST /admin/cache/clear` - Delete the bootstrap cache entry
//! - `POST /admin/preload/generate` - Write the preload manifest

use axum::{
    Extension, Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use worker_runtime_common::PoolStatus;
use worker_runtime_core::{EntryPoint, WorkerSnapshot};

use crate::handler::error_to_response;
use crate::state::AppState;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Admin API state containing app state and auth token.
pub struct AdminState<E: EntryPoint> {
    /// Application state (runtime and shutdown signal).
    pub app_state: AppState<E>,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

impl<E: EntryPoint> Clone for AdminState<E> {
    fn clone(&self) -> Self {
        Self {
            app_state: self.app_state.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

/// Pool status for API responses.
#[derive(Debug, Serialize)]
pub struct StatusInfo {
    /// Aggregate pool status.
    pub status: PoolStatus,
    /// One snapshot per occupied slot.
    pub workers: Vec<WorkerSnapshot>,
    /// Bootstrap cache entry, if the facility is enabled.
    pub cache: Option<CacheInfo>,
    /// Preload manifest path, if the facility is enabled.
    pub preload_manifest: Option<String>,
}

/// Bootstrap cache state for API responses.
#[derive(Debug, Serialize)]
pub struct CacheInfo {
    /// Path of the cache entry.
    pub path: String,
    /// Whether a fresh entry exists.
    pub valid: bool,
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
///
/// # Arguments
///
/// * `admin_state` - Admin state containing app state and auth token
pub fn build_admin_router<E: EntryPoint>(admin_state: AdminState<E>) -> Router<AppState<E>> {
    Router::new()
        .route("/status", get(status::<E>))
        .route("/reload", post(reload::<E>))
        .route("/stop", post(stop::<E>))
        .route("/cache/clear", post(clear_cache::<E>))
        .route("/preload/generate", post(generate_preload::<E>))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
///
/// The comparison runs in constant time with respect to the token contents.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), (StatusCode, &'static str)> {
    match headers.get(ADMIN_TOKEN_HEADER) {
        Some(token) => {
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header")),
    }
}

/// Report pool and facility status.
///
/// # Request
///
/// `GET /admin/status`
///
/// # Response
///
/// ```json
/// {
///   "status": "running",
///   "workers": [
///     { "slot": 0, "generation": 1, "status": "running", "requests": 3, "max_requests": 1000 }
///   ],
///   "cache": { "path": "storage/cache/bootstrap.json", "valid": true },
///   "preload_manifest": "storage/preload.list"
/// }
/// ```
#[instrument(skip_all)]
pub async fn status<E: EntryPoint>(
    Extension(admin_state): Extension<AdminState<E>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let runtime = admin_state.app_state.runtime();
    let cache = runtime.bootstrap_cache().map(|cache| CacheInfo {
        path: cache.path().display().to_string(),
        valid: cache.is_valid(),
    });
    let preload_manifest = runtime
        .preload()
        .map(|manifest| manifest.path().display().to_string());

    Json(StatusInfo {
        status: runtime.status(),
        workers: runtime.pool().map(|pool| pool.workers()).unwrap_or_default(),
        cache,
        preload_manifest,
    })
    .into_response()
}

/// Reload every worker, one slot at a time.
///
/// # Request
///
/// `POST /admin/reload`
#[instrument(skip_all)]
pub async fn reload<E: EntryPoint>(
    Extension(admin_state): Extension<AdminState<E>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let runtime = admin_state.app_state.runtime();
    match runtime.reload().await {
        Ok(()) => {
            info!("Workers reloaded");
            Json(serde_json::json!({
                "status": runtime.status(),
                "message": "Workers reloaded"
            }))
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Reload failed");
            error_to_response(&e)
        }
    }
}

/// Stop the pool, then ask the server to shut down.
///
/// # Request
///
/// `POST /admin/stop`
///
/// # Response
///
/// ```json
/// {
///   "stopped": 4,
///   "teardown_errors": [],
///   "aborted": []
/// }
/// ```
#[instrument(skip_all)]
pub async fn stop<E: EntryPoint>(
    Extension(admin_state): Extension<AdminState<E>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let report = admin_state.app_state.runtime().stop().await;
    if !report.is_clean() {
        warn!(
            teardown_errors = report.teardown_errors.len(),
            aborted = report.aborted.len(),
            "Pool stopped with errors"
        );
    }
    admin_state.app_state.request_shutdown();

    Json(report).into_response()
}

/// Delete the bootstrap cache entry.
///
/// # Request
///
/// `POST /admin/cache/clear`
///
/// # Response
///
/// ```json
/// { "cleared": true }
/// ```
#[instrument(skip_all)]
pub async fn clear_cache<E: EntryPoint>(
    Extension(admin_state): Extension<AdminState<E>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    match admin_state.app_state.runtime().clear_bootstrap_cache() {
        Ok(cleared) => Json(serde_json::json!({ "cleared": cleared })).into_response(),
        Err(e) => error_to_response(&e),
    }
}

/// Write the preload manifest.
///
/// # Request
///
/// `POST /admin/preload/generate`
///
/// # Response
///
/// ```json
/// { "path": "storage/preload.list", "files": 42, "modules": 2 }
/// ```
#[instrument(skip_all)]
pub async fn generate_preload<E: EntryPoint>(
    Extension(admin_state): Extension<AdminState<E>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    match admin_state.app_state.runtime().generate_preload() {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_to_response(&e),
    }
}
