//! HTTP server implementation.
//!
//! This module provides the main [`WorkerServer`] struct for running
//! the HTTP front of a worker runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use worker_runtime_common::{RuntimeError, ServerConfigFile};
use worker_runtime_core::{EntryPoint, Runtime};

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Admin API, if enabled.
    pub admin: Option<AdminRouterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Build a server config from the `[server]` section of a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address cannot be parsed.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, RuntimeError> {
        let bind_addr = file.bind_addr.parse().map_err(|e| {
            RuntimeError::config(format!("Invalid bind address '{}': {e}", file.bind_addr))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
            admin: None,
        })
    }

    /// Create a new server config with custom bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Enable the Admin API under `prefix`.
    pub fn with_admin(mut self, prefix: impl Into<String>, token: impl Into<String>) -> Self {
        self.admin = Some(AdminRouterConfig {
            prefix: prefix.into(),
            token: token.into(),
        });
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP front for a worker runtime.
///
/// The server does not start the pool; call [`Runtime::start`] first.
/// When the server exits it stops the pool.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use worker_runtime_server::{ServerConfig, WorkerServer};
///
/// let runtime = Arc::new(Runtime::new(config, entry, assemble)?);
/// runtime.start(4, 1000).await?;
///
/// WorkerServer::new(runtime, ServerConfig::default()).run().await?;
/// ```
pub struct WorkerServer<E: EntryPoint> {
    /// Application state.
    state: AppState<E>,
    /// Server configuration.
    config: ServerConfig,
}

impl<E: EntryPoint> WorkerServer<E> {
    /// Create a new server instance.
    pub fn new(runtime: Arc<Runtime<E>>, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(runtime),
            config,
        }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState<E> {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled, or through the
    /// Admin API stop endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        self.serve(listener).await
    }

    /// Start the server on an ephemeral port and return a handle for testing.
    ///
    /// The server binds to `127.0.0.1:0` and returns a handle that can be
    /// used to get the actual address and shut down the server.
    pub async fn start_test(self) -> Result<TestHandle<E>, RuntimeError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::config(format!("Failed to get addr: {e}")))?;

        let state = self.state.clone();
        let handle = tokio::spawn(self.serve(listener));

        Ok(TestHandle {
            addr,
            state,
            handle,
        })
    }

    async fn serve(self, listener: TcpListener) -> Result<(), RuntimeError> {
        let app = build_router_with_admin(
            self.state.clone(),
            self.config.request_timeout(),
            self.config.admin.clone(),
        );

        let state = self.state.clone();
        let signals = self.config.graceful_shutdown;
        let shutdown = async move {
            if signals {
                tokio::select! {
                    () = shutdown_signal() => {},
                    () = state.shutdown_requested() => {},
                }
            } else {
                state.shutdown_requested().await;
            }
        };

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RuntimeError::config(format!("Server error: {e}")));

        let report = self.state.runtime().stop().await;
        if !report.is_clean() {
            warn!(
                teardown_errors = report.teardown_errors.len(),
                aborted = ?report.aborted,
                "Workers stopped with errors"
            );
        }

        info!("Server shutdown complete");
        served
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle<E: EntryPoint> {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state.
    state: AppState<E>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), RuntimeError>>,
}

impl<E: EntryPoint> TestHandle<E> {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState<E> {
        &self.state
    }

    /// Shutdown the server gracefully and stop the pool.
    pub async fn shutdown(self) {
        self.state.request_shutdown();
        let _ = self.handle.await;
    }

    /// Wait for the server to exit on its own.
    pub async fn join(self) -> Result<(), RuntimeError> {
        self.handle
            .await
            .map_err(|e| RuntimeError::config(format!("Server task failed: {e}")))?
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// If a handler cannot be installed, that signal is never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.graceful_shutdown);
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_server_config_builder() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let config = ServerConfig::default()
            .with_bind_addr(addr)
            .with_timeout(60)
            .with_admin("/ops", "token");

        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.admin.unwrap().prefix, "/ops");
    }

    #[test]
    fn test_server_config_from_file() {
        let file = ServerConfigFile {
            bind_addr: "127.0.0.1:9000".to_string(),
            request_timeout_secs: 5,
            graceful_shutdown: false,
        };

        let config = ServerConfig::from_file(&file).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(!config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_invalid_addr() {
        let file = ServerConfigFile {
            bind_addr: "not an address".to_string(),
            ..ServerConfigFile::default()
        };

        let err = ServerConfig::from_file(&file).unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }
}
