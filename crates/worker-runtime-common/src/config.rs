//! Configuration structures for the worker-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`PoolConfig`]: Worker pool sizing, request budget, and shutdown grace
//! - [`CacheConfig`]: Bootstrap cache location, inputs, and freshness strategy
//! - [`PreloadConfig`]: Preload manifest location and registrations

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the worker-runtime.
/// It is usually embedded in a TOML [`ConfigFile`](crate::ConfigFile).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Worker pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Bootstrap cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Preload manifest configuration.
    #[serde(default)]
    pub preload: PreloadConfig,
}

impl RuntimeConfig {
    /// Check the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.pool.validate()?;

        if self.cache.enabled && self.cache.path.trim().is_empty() {
            return Err(RuntimeError::config("cache.path must not be empty"));
        }

        if self.preload.enabled && self.preload.manifest_path.trim().is_empty() {
            return Err(RuntimeError::config(
                "preload.manifest_path must not be empty",
            ));
        }

        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of workers spawned on start.
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Requests a worker serves before it recycles itself.
    #[serde(default = "defaults::max_requests")]
    pub max_requests: u64,

    /// Grace period for in-flight requests when stopping, in milliseconds.
    #[serde(default = "defaults::stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Interval of the background liveness check, in milliseconds.
    ///
    /// `0` disables the background check; crashes are then only detected
    /// on the dispatch path.
    #[serde(default = "defaults::liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Capacity of each worker's command queue.
    #[serde(default = "defaults::command_queue")]
    pub command_queue: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            max_requests: defaults::max_requests(),
            stop_grace_ms: defaults::stop_grace_ms(),
            liveness_interval_ms: defaults::liveness_interval_ms(),
            command_queue: defaults::command_queue(),
        }
    }
}

impl PoolConfig {
    /// Check pool sizing.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers == 0 {
            return Err(RuntimeError::config("pool.workers must be at least 1"));
        }
        if self.max_requests == 0 {
            return Err(RuntimeError::config("pool.max_requests must be at least 1"));
        }
        if self.command_queue == 0 {
            return Err(RuntimeError::config("pool.command_queue must be at least 1"));
        }
        Ok(())
    }

    /// Get the stop grace period as a `Duration`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Get the liveness interval, or `None` when disabled.
    pub fn liveness_interval(&self) -> Option<Duration> {
        (self.liveness_interval_ms > 0).then(|| Duration::from_millis(self.liveness_interval_ms))
    }
}

/// How the bootstrap cache decides whether its inputs changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStrategy {
    /// Compare the latest input modification time with the stored one.
    #[default]
    Mtime,
    /// Compare a SHA-256 digest over the input contents.
    ContentHash,
}

/// Bootstrap cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Enable the bootstrap cache.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Location of the cache entry.
    #[serde(default = "defaults::cache_path")]
    pub path: String,

    /// Files whose changes invalidate the cache.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Freshness check strategy.
    #[serde(default)]
    pub strategy: FreshnessStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            path: defaults::cache_path(),
            inputs: Vec::new(),
            strategy: FreshnessStrategy::default(),
        }
    }
}

/// Preload manifest configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreloadConfig {
    /// Enable the preload manifest.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Where the manifest is written.
    #[serde(default = "defaults::manifest_path")]
    pub manifest_path: String,

    /// File extensions collected from registered directories.
    ///
    /// Empty means every regular file.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Individually registered files.
    #[serde(default)]
    pub files: Vec<String>,

    /// Registered module directories.
    #[serde(default)]
    pub modules: Vec<PreloadModule>,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            manifest_path: defaults::manifest_path(),
            extensions: Vec::new(),
            files: Vec::new(),
            modules: Vec::new(),
        }
    }
}

/// A module directory registered for preloading.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PreloadModule {
    /// Module name, used as the manifest group separator.
    pub name: String,

    /// Directory walked recursively.
    pub path: String,
}

/// Default value functions for serde.
mod defaults {
    pub const fn workers() -> usize {
        4
    }

    pub const fn max_requests() -> u64 {
        1000
    }

    pub const fn stop_grace_ms() -> u64 {
        5000
    }

    pub const fn liveness_interval_ms() -> u64 {
        1000
    }

    pub const fn command_queue() -> usize {
        64
    }

    pub const fn enabled() -> bool {
        true
    }

    pub fn cache_path() -> String {
        "storage/cache/bootstrap.json".to_string()
    }

    pub fn manifest_path() -> String {
        "storage/preload.list".to_string()
    }
}
