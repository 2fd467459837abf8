//! Common types, errors, and configuration for worker-runtime.
//!
//! This crate provides shared functionality used across the worker-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the pool, bootstrap cache, and preload manifest
//! - Worker and pool status types

pub mod config;
pub mod config_file;
pub mod error;
pub mod status;

pub use config::{
    CacheConfig, FreshnessStrategy, PoolConfig, PreloadConfig, PreloadModule, RuntimeConfig,
};
pub use config_file::{AdminConfig, ConfigFile, ConfigFileError, RouteEntry, ServerConfigFile};
pub use error::{BoxError, PoolError, RuntimeError, WorkerError};
pub use status::{PoolStatus, WorkerStatus};
