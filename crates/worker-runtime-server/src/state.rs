//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::sync::Arc;

use tokio::sync::Notify;

use worker_runtime_core::{EntryPoint, Runtime};

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
pub struct AppState<E: EntryPoint> {
    /// The runtime that owns the worker pool.
    runtime: Arc<Runtime<E>>,

    /// Signalled when the admin API asks the server to exit.
    shutdown: Arc<Notify>,
}

impl<E: EntryPoint> AppState<E> {
    /// Create new application state around a runtime.
    pub fn new(runtime: Arc<Runtime<E>>) -> Self {
        Self {
            runtime,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get the runtime.
    pub fn runtime(&self) -> &Arc<Runtime<E>> {
        &self.runtime
    }

    /// Ask the server to shut down.
    ///
    /// The request is remembered if nobody is waiting yet.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Wait until [`request_shutdown`](Self::request_shutdown) is called.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}

impl<E: EntryPoint> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<E: EntryPoint> std::fmt::Debug for AppState<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("status", &self.runtime.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use worker_runtime_common::{BoxError, PoolStatus, RuntimeConfig};
    use worker_runtime_core::{DispatchContext, Request, Response};

    use super::*;

    struct Noop;

    impl EntryPoint for Noop {
        type App = ();

        fn dispatch(
            &self,
            _app: &(),
            _ctx: &DispatchContext,
            _request: Request,
        ) -> Result<Response, BoxError> {
            Ok(Response::default())
        }
    }

    fn state() -> AppState<Noop> {
        let mut config = RuntimeConfig::default();
        config.cache.enabled = false;
        config.preload.enabled = false;
        let runtime = Runtime::new(config, Noop, || Ok(())).unwrap();
        AppState::new(Arc::new(runtime))
    }

    #[test]
    fn test_app_state_creation() {
        let state = state();
        assert_eq!(state.runtime().status(), PoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_request_is_remembered() {
        let state = state();
        state.clone().request_shutdown();

        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), state.shutdown_requested()).await
        );
    }
}
