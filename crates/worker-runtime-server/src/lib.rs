//! HTTP front for worker-runtime.
//!
//! This crate exposes a [`Runtime`](worker_runtime_core::Runtime) over HTTP.
//! It handles:
//!
//! - Forwarding every non-reserved request to the worker pool
//! - Request/response transformation
//! - Mapping worker failures to HTTP statuses
//! - Health and readiness checks
//! - The token-protected Admin API used by operator commands
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use worker_runtime_core::Runtime;
//! use worker_runtime_server::{ServerConfig, WorkerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Arc::new(Runtime::new(config, MyEntry, assemble)?);
//!     runtime.start(4, 1000).await?;
//!
//!     let server_config = ServerConfig::default().with_admin("/admin", "secret");
//!     WorkerServer::new(runtime, server_config).run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::AdminRouterConfig;
pub use server::{ServerConfig, TestHandle, WorkerServer};
pub use state::AppState;
