//! Runtime facade.
//!
//! [`Runtime`] composes the bootstrap cache, the preload manifest, and the
//! worker pool behind the operations an operator drives. The entry point
//! and the application assembly callback are handed in explicitly; there
//! is no ambient lookup.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument};

use worker_runtime_common::{
    BoxError, PoolError, PoolStatus, RuntimeConfig, RuntimeError,
};

use crate::bootstrap::BootstrapCache;
use crate::entry::{EntryPoint, Request, Response};
use crate::pool::{StopReport, WorkerPool};
use crate::preload::{ManifestSummary, PreloadManifest};

const CACHE_FACILITY: &str = "Bootstrap cache";
const PRELOAD_FACILITY: &str = "Preload manifest";

/// Callback that assembles the application.
pub type Assemble<A> = Arc<dyn Fn() -> Result<A, BoxError> + Send + Sync>;

/// Composition of bootstrap cache, preload manifest, and worker pool.
pub struct Runtime<E: EntryPoint> {
    config: RuntimeConfig,
    entry: Arc<E>,
    assemble: Assemble<E::App>,
    cache: Option<BootstrapCache>,
    preload: Option<Mutex<PreloadManifest>>,
    pool: RwLock<Option<WorkerPool<E>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<E: EntryPoint> Runtime<E> {
    /// Create a runtime.
    ///
    /// Validates `config` and registers the configured preload paths, so a
    /// missing path fails here rather than at generation time.
    pub fn new<F>(config: RuntimeConfig, entry: E, assemble: F) -> Result<Self, RuntimeError>
    where
        F: Fn() -> Result<E::App, BoxError> + Send + Sync + 'static,
    {
        config.validate()?;

        let cache = config
            .cache
            .enabled
            .then(|| BootstrapCache::from_config(&config.cache));
        let preload = if config.preload.enabled {
            Some(Mutex::new(PreloadManifest::from_config(&config.preload)?))
        } else {
            None
        };

        Ok(Self {
            config,
            entry: Arc::new(entry),
            assemble: Arc::new(assemble),
            cache,
            preload,
            pool: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The entry point shared by every worker.
    pub fn entry(&self) -> &Arc<E> {
        &self.entry
    }

    /// Bootstrap the application and start a new pool with it.
    #[instrument(skip(self))]
    pub async fn start(&self, worker_count: usize, max_requests: u64) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.try_lock().map_err(|_| PoolError::Busy)?;

        if self.status() != PoolStatus::Stopped {
            return Err(PoolError::AlreadyRunning.into());
        }

        let mut pool_config = self.config.pool.clone();
        pool_config.workers = worker_count;
        pool_config.max_requests = max_requests;
        pool_config.validate()?;

        let app = self.bootstrap().await?;
        let pool = WorkerPool::new(Arc::clone(&self.entry), Arc::new(app), pool_config);
        pool.start().await?;

        *self.pool.write() = Some(pool);
        info!(workers = worker_count, max_requests, "Runtime started");
        Ok(())
    }

    /// Stop the current pool. A runtime that never started reports nothing.
    pub async fn stop(&self) -> StopReport {
        let _guard = self.lifecycle.lock().await;
        match self.pool() {
            Some(pool) => pool.stop().await,
            None => StopReport::default(),
        }
    }

    /// Rolling reload of the current pool.
    pub async fn reload(&self) -> Result<(), RuntimeError> {
        let pool = self.pool().ok_or(PoolError::NotRunning)?;
        pool.reload().await
    }

    /// Dispatch a request to the current pool.
    pub async fn dispatch(&self, request: Request) -> Result<Response, RuntimeError> {
        let pool = self.pool().ok_or(PoolError::NotRunning)?;
        pool.dispatch(request).await
    }

    /// Status of the current pool.
    pub fn status(&self) -> PoolStatus {
        self.pool
            .read()
            .as_ref()
            .map_or(PoolStatus::Stopped, WorkerPool::status)
    }

    /// The current pool, if the runtime was started.
    pub fn pool(&self) -> Option<WorkerPool<E>> {
        self.pool.read().clone()
    }

    /// Assemble the application, through the bootstrap cache when enabled.
    pub async fn bootstrap(&self) -> Result<E::App, RuntimeError> {
        let assemble = Arc::clone(&self.assemble);
        let cache = self.cache.clone();

        tokio::task::spawn_blocking(move || match cache {
            Some(cache) => cache.get_or_build(|| assemble()),
            None => assemble().map_err(|e| RuntimeError::bootstrap(e.to_string())),
        })
        .await
        .map_err(|e| RuntimeError::bootstrap(format!("bootstrap task failed: {e}")))?
    }

    /// The bootstrap cache, `None` when disabled.
    pub fn bootstrap_cache(&self) -> Option<&BootstrapCache> {
        self.cache.as_ref()
    }

    /// Delete the bootstrap cache entry.
    pub fn clear_bootstrap_cache(&self) -> Result<bool, RuntimeError> {
        self.cache
            .as_ref()
            .ok_or(RuntimeError::FacilityUnavailable {
                facility: CACHE_FACILITY,
            })?
            .invalidate()
    }

    /// Copy of the preload registry, `None` when disabled.
    pub fn preload(&self) -> Option<PreloadManifest> {
        self.preload.as_ref().map(|manifest| manifest.lock().clone())
    }

    /// Register a file for preloading.
    pub fn register_file_preload(&self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        self.with_preload(|manifest| manifest.register_file(path))
    }

    /// Register a module directory for preloading.
    pub fn register_module_preload(
        &self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), RuntimeError> {
        self.with_preload(|manifest| manifest.register_directory(name, path))
    }

    /// Write the preload manifest.
    pub fn generate_preload(&self) -> Result<ManifestSummary, RuntimeError> {
        self.with_preload(|manifest| manifest.generate())
    }

    /// Delete the preload manifest.
    pub fn clear_preload(&self) -> Result<bool, RuntimeError> {
        self.with_preload(|manifest| manifest.clear())
    }

    fn with_preload<T>(
        &self,
        f: impl FnOnce(&mut PreloadManifest) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let manifest = self.preload.as_ref().ok_or(RuntimeError::FacilityUnavailable {
            facility: PRELOAD_FACILITY,
        })?;
        f(&mut manifest.lock())
    }
}

impl<E: EntryPoint> std::fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("status", &self.status())
            .field("cache", &self.cache)
            .field("preload", &self.preload.is_some())
            .finish_non_exhaustive()
    }
}
