//! Bootstrap cache.
//!
//! Assembling the application is expensive, so the result is persisted as a
//! JSON entry together with a fingerprint of the files that define it. A
//! later bootstrap reuses the entry as long as the fingerprint still holds.
//!
//! Two freshness strategies are available:
//! - [`FreshnessStrategy::Mtime`]: the stored latest modification time must
//!   be at least the current latest modification time of every input.
//! - [`FreshnessStrategy::ContentHash`]: a SHA-256 digest over every input
//!   must match. Immune to coarse clocks and fast successive writes.
//!
//! A missing input means unknown freshness, and the entry is never used.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use worker_runtime_common::{BoxError, CacheConfig, FreshnessStrategy, RuntimeError};

use crate::fs::{remove_if_exists, write_atomic};

/// Version of the on-disk entry layout. Any other version is corrupt.
const FORMAT_VERSION: u32 = 1;

/// Summary of the bootstrap inputs at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Fingerprint {
    /// Latest modification time among the inputs, in nanoseconds since
    /// the Unix epoch.
    Mtime { latest_mtime_ns: u64 },
    /// Hex-encoded SHA-256 over every input path and its contents.
    ContentHash { sha256: String },
}

impl Fingerprint {
    /// Returns `true` if an entry stamped with `self` is still fresh
    /// against the `current` fingerprint.
    pub fn is_fresh(&self, current: &Fingerprint) -> bool {
        match (self, current) {
            (
                Self::Mtime {
                    latest_mtime_ns: stored,
                },
                Self::Mtime {
                    latest_mtime_ns: now,
                },
            ) => stored >= now,
            (Self::ContentHash { sha256: stored }, Self::ContentHash { sha256: now }) => {
                stored == now
            }
            _ => false,
        }
    }
}

#[derive(Serialize)]
struct EntryRef<'a, T> {
    format: u32,
    fingerprint: Option<&'a Fingerprint>,
    created_at_ms: u64,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Entry<T> {
    format: u32,
    fingerprint: Option<Fingerprint>,
    payload: T,
}

impl<T> Entry<T> {
    fn is_fresh(&self, current: &Fingerprint) -> bool {
        self.fingerprint
            .as_ref()
            .is_some_and(|stored| stored.is_fresh(current))
    }
}

/// Persistent memo of the assembled application.
#[derive(Debug, Clone)]
pub struct BootstrapCache {
    path: PathBuf,
    inputs: Vec<PathBuf>,
    strategy: FreshnessStrategy,
}

impl BootstrapCache {
    /// Create a cache stored at `path` with no declared inputs.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inputs: Vec::new(),
            strategy: FreshnessStrategy::default(),
        }
    }

    /// Create a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.path)
            .with_inputs(&config.inputs)
            .with_strategy(config.strategy)
    }

    /// Declare files whose changes invalidate the cache.
    #[must_use]
    pub fn with_inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.inputs
            .extend(inputs.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    /// Set the freshness strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: FreshnessStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Location of the cache entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared inputs.
    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Freshness strategy.
    pub fn strategy(&self) -> FreshnessStrategy {
        self.strategy
    }

    /// Fingerprint of the inputs as they are now.
    ///
    /// `None` if any input is missing or unreadable.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self.strategy {
            FreshnessStrategy::Mtime => self.mtime_fingerprint(),
            FreshnessStrategy::ContentHash => self.content_fingerprint(),
        }
    }

    fn mtime_fingerprint(&self) -> Option<Fingerprint> {
        let mut latest = 0u64;
        for input in &self.inputs {
            let modified = match fs::metadata(input).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(input = %input.display(), error = %e, "Bootstrap input unavailable");
                    return None;
                }
            };
            latest = latest.max(unix_nanos(modified));
        }
        Some(Fingerprint::Mtime {
            latest_mtime_ns: latest,
        })
    }

    fn content_fingerprint(&self) -> Option<Fingerprint> {
        let mut hasher = Sha256::new();
        for input in &self.inputs {
            let contents = match fs::read(input) {
                Ok(contents) => contents,
                Err(e) => {
                    debug!(input = %input.display(), error = %e, "Bootstrap input unavailable");
                    return None;
                }
            };
            hasher.update(input.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }
        Some(Fingerprint::ContentHash {
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Returns `true` if an entry file exists, fresh or not.
    pub fn is_cached(&self) -> bool {
        self.path.is_file()
    }

    /// Returns `true` if the entry exists, decodes, and is fresh.
    pub fn is_valid(&self) -> bool {
        let Some(current) = self.fingerprint() else {
            return false;
        };
        self.read_entry::<IgnoredAny>()
            .is_ok_and(|entry| entry.is_fresh(&current))
    }

    /// Load the cached application without checking freshness.
    ///
    /// A missing or undecodable entry is [`RuntimeError::CacheCorrupt`].
    pub fn load<T: DeserializeOwned>(&self) -> Result<T, RuntimeError> {
        self.read_entry().map(|entry| entry.payload)
    }

    /// Persist `app` stamped with the current fingerprint.
    pub fn save<T: Serialize>(&self, app: &T) -> Result<(), RuntimeError> {
        self.write_entry(app, self.fingerprint().as_ref())
    }

    /// Delete the entry. Returns `false` if there was none.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn invalidate(&self) -> Result<bool, RuntimeError> {
        let removed = remove_if_exists(&self.path)?;
        if removed {
            info!("Bootstrap cache cleared");
        }
        Ok(removed)
    }

    /// Return the cached application, or build and persist it.
    ///
    /// `build` is not called when a fresh entry exists. A corrupt entry is
    /// logged and rebuilt. The fingerprint is taken before building, so an
    /// input edited during the build invalidates the new entry.
    #[instrument(skip(self, build), fields(path = %self.path.display()))]
    pub fn get_or_build<T, F>(&self, build: F) -> Result<T, RuntimeError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, BoxError>,
    {
        let current = self.fingerprint();

        match &current {
            Some(current) => match self.read_entry::<T>() {
                Ok(entry) if entry.is_fresh(current) => {
                    debug!("Bootstrap cache hit");
                    return Ok(entry.payload);
                }
                Ok(_) => debug!("Bootstrap cache stale"),
                Err(err) if self.is_cached() => {
                    warn!(error = %err, "Bootstrap cache unusable, rebuilding");
                }
                Err(_) => debug!("Bootstrap cache miss"),
            },
            None => debug!("Bootstrap inputs incomplete, cache bypassed"),
        }

        let app = build().map_err(|e| RuntimeError::bootstrap(e.to_string()))?;

        match &current {
            Some(fingerprint) => {
                self.write_entry(&app, Some(fingerprint))?;
                info!("Bootstrap cache written");
            }
            None => warn!("Bootstrap inputs missing, application not cached"),
        }

        Ok(app)
    }

    fn read_entry<T: DeserializeOwned>(&self) -> Result<Entry<T>, RuntimeError> {
        let bytes = fs::read(&self.path)
            .map_err(|e| RuntimeError::cache_corrupt(&self.path, e.to_string()))?;
        let entry: Entry<T> = serde_json::from_slice(&bytes)
            .map_err(|e| RuntimeError::cache_corrupt(&self.path, e.to_string()))?;

        if entry.format != FORMAT_VERSION {
            return Err(RuntimeError::cache_corrupt(
                &self.path,
                format!("unsupported format version {}", entry.format),
            ));
        }
        Ok(entry)
    }

    fn write_entry<T: Serialize>(
        &self,
        app: &T,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<(), RuntimeError> {
        let entry = EntryRef {
            format: FORMAT_VERSION,
            fingerprint,
            created_at_ms: u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0),
            )
            .unwrap_or(u64::MAX),
            payload: app,
        };
        let bytes = serde_json::to_vec_pretty(&entry)
            .map_err(|e| RuntimeError::bootstrap(format!("failed to encode application: {e}")))?;

        write_atomic(&self.path, &bytes)
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Wiring {
        services: Vec<String>,
    }

    fn wiring() -> Wiring {
        Wiring {
            services: vec!["router".into(), "mailer".into()],
        }
    }

    fn touch_future(path: &Path) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        input: PathBuf,
        cache: BootstrapCache,
    }

    fn fixture(strategy: FreshnessStrategy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bootstrap.toml");
        fs::write(&input, "services = 2").unwrap();
        let cache = BootstrapCache::new(dir.path().join("cache/bootstrap.json"))
            .with_inputs([&input])
            .with_strategy(strategy);
        Fixture {
            _dir: dir,
            input,
            cache,
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let f = fixture(FreshnessStrategy::Mtime);

        f.cache.save(&wiring()).unwrap();

        assert!(f.cache.is_cached());
        assert!(f.cache.is_valid());
        assert_eq!(f.cache.load::<Wiring>().unwrap(), wiring());
    }

    #[test]
    fn test_touched_input_invalidates() {
        let f = fixture(FreshnessStrategy::Mtime);
        f.cache.save(&wiring()).unwrap();

        touch_future(&f.input);

        assert!(f.cache.is_cached());
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_missing_input_is_invalid() {
        let f = fixture(FreshnessStrategy::Mtime);
        f.cache.save(&wiring()).unwrap();

        fs::remove_file(&f.input).unwrap();

        assert!(f.cache.fingerprint().is_none());
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_content_hash_ignores_mtime() {
        let f = fixture(FreshnessStrategy::ContentHash);
        f.cache.save(&wiring()).unwrap();

        touch_future(&f.input);
        assert!(f.cache.is_valid());

        fs::write(&f.input, "services = 3").unwrap();
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_load_missing_entry_is_corrupt() {
        let f = fixture(FreshnessStrategy::Mtime);

        let err = f.cache.load::<Wiring>().unwrap_err();
        assert!(matches!(err, RuntimeError::CacheCorrupt { .. }));
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let f = fixture(FreshnessStrategy::Mtime);
        fs::create_dir_all(f.cache.path().parent().unwrap()).unwrap();
        fs::write(f.cache.path(), b"{ not json").unwrap();

        let err = f.cache.load::<Wiring>().unwrap_err();
        assert!(matches!(err, RuntimeError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_unknown_format_is_corrupt() {
        let f = fixture(FreshnessStrategy::Mtime);
        f.cache.save(&wiring()).unwrap();
        let text = fs::read_to_string(f.cache.path()).unwrap();
        fs::write(
            f.cache.path(),
            text.replace("\"format\": 1", "\"format\": 99"),
        )
        .unwrap();

        assert!(f.cache.load::<Wiring>().is_err());
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_get_or_build_uses_fresh_entry() {
        let f = fixture(FreshnessStrategy::Mtime);
        let builds = Cell::new(0);
        let build = || {
            builds.set(builds.get() + 1);
            Ok(wiring())
        };

        assert_eq!(f.cache.get_or_build(build).unwrap(), wiring());
        assert_eq!(f.cache.get_or_build(build).unwrap(), wiring());
        assert_eq!(builds.get(), 1);

        touch_future(&f.input);
        f.cache.get_or_build(build).unwrap();
        assert_eq!(builds.get(), 2);
    }

    #[test]
    fn test_get_or_build_rebuilds_corrupt_entry() {
        let f = fixture(FreshnessStrategy::Mtime);
        fs::create_dir_all(f.cache.path().parent().unwrap()).unwrap();
        fs::write(f.cache.path(), b"garbage").unwrap();

        let app = f.cache.get_or_build(|| Ok(wiring())).unwrap();

        assert_eq!(app, wiring());
        assert!(f.cache.is_valid());
    }

    #[test]
    fn test_get_or_build_without_inputs_skips_persist() {
        let f = fixture(FreshnessStrategy::Mtime);
        fs::remove_file(&f.input).unwrap();

        let app = f.cache.get_or_build(|| Ok(wiring())).unwrap();

        assert_eq!(app, wiring());
        assert!(!f.cache.is_cached());
    }

    #[test]
    fn test_get_or_build_propagates_build_error() {
        let f = fixture(FreshnessStrategy::Mtime);

        let err = f
            .cache
            .get_or_build::<Wiring, _>(|| Err("container wiring failed".into()))
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Bootstrap { .. }));
        assert!(!f.cache.is_cached());
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let f = fixture(FreshnessStrategy::Mtime);
        f.cache.save(&wiring()).unwrap();

        assert!(f.cache.invalidate().unwrap());
        assert!(!f.cache.invalidate().unwrap());
        assert!(!f.cache.is_cached());
    }

    #[test]
    fn test_failed_save_keeps_previous_entry() {
        let f = fixture(FreshnessStrategy::Mtime);
        f.cache.save(&wiring()).unwrap();
        let before = fs::read(f.cache.path()).unwrap();

        // Parent is a regular file, so nothing can be written there.
        let broken = BootstrapCache::new(f.input.join("bootstrap.json"));
        let err = broken.save(&wiring()).unwrap_err();

        assert!(matches!(err, RuntimeError::Io { .. }));
        assert_eq!(fs::read(f.cache.path()).unwrap(), before);
    }

    #[test]
    fn test_from_config() {
        let config = CacheConfig {
            path: "/tmp/cache.json".into(),
            inputs: vec!["a.toml".into(), "b.toml".into()],
            strategy: FreshnessStrategy::ContentHash,
            ..CacheConfig::default()
        };

        let cache = BootstrapCache::from_config(&config);

        assert_eq!(cache.path(), Path::new("/tmp/cache.json"));
        assert_eq!(cache.inputs().len(), 2);
        assert_eq!(cache.strategy(), FreshnessStrategy::ContentHash);
    }
}
