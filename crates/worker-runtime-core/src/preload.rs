//! Preload manifest generation.
//!
//! The manifest lists the source files the host runtime should compile
//! ahead of time, one absolute path per line. Generation is pure data: how
//! the host consumes the list is not this module's concern.
//!
//! # Format
//!
//! ```text
//! # worker-runtime preload manifest
//! # Generated file, do not edit.
//! /srv/app/bootstrap.js
//! # module: billing
//! /srv/app/modules/billing/invoice.js
//! /srv/app/modules/billing/tax/rates.js
//! ```
//!
//! Individually registered files come first, then every registered module
//! directory in registration order. Directories are walked recursively in
//! lexicographic order and every path appears once, at its first
//! occurrence. The output has no timestamps, so identical registrations
//! over an identical tree produce identical bytes.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument};

use worker_runtime_common::{PreloadConfig, RuntimeError};

use crate::fs::{remove_if_exists, write_atomic};

const HEADER: &str = "# worker-runtime preload manifest\n# Generated file, do not edit.\n";
const MODULE_PREFIX: &str = "# module: ";

/// Files collected for one section of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestGroup {
    /// Module name, `None` for individually registered files.
    pub module: Option<String>,
    /// Canonical file paths.
    pub files: Vec<PathBuf>,
}

/// Result of [`PreloadManifest::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    /// Where the manifest was written.
    pub path: PathBuf,
    /// Number of files listed.
    pub files: usize,
    /// Number of module sections.
    pub modules: usize,
}

/// Registry of files and module directories to preload.
#[derive(Debug, Clone)]
pub struct PreloadManifest {
    path: PathBuf,
    extensions: Vec<String>,
    files: Vec<PathBuf>,
    modules: Vec<(String, PathBuf)>,
}

impl PreloadManifest {
    /// Create an empty registry writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extensions: Vec::new(),
            files: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Create a registry from configuration, registering every configured
    /// file and module.
    pub fn from_config(config: &PreloadConfig) -> Result<Self, RuntimeError> {
        let mut manifest = Self::new(&config.manifest_path).with_extensions(&config.extensions);
        for file in &config.files {
            manifest.register_file(file)?;
        }
        for module in &config.modules {
            manifest.register_directory(&module.name, &module.path)?;
        }
        Ok(manifest)
    }

    /// Only collect files with these extensions from module directories.
    ///
    /// Leading dots are ignored and matching is case-insensitive. No
    /// extensions means every regular file.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    /// Where the manifest is written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registered files, canonicalized.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Registered module directories, canonicalized, in registration order.
    pub fn modules(&self) -> &[(String, PathBuf)] {
        &self.modules
    }

    /// Register a single file.
    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let path = path.as_ref();
        let canonical = canonicalize(path)?;
        if !canonical.is_file() {
            return Err(RuntimeError::config(format!(
                "preload path '{}' is not a file",
                path.display()
            )));
        }

        if !self.files.contains(&canonical) {
            debug!(path = %canonical.display(), "Registered preload file");
            self.files.push(canonical);
        }
        Ok(())
    }

    /// Register a module directory under `name`.
    ///
    /// Registering a name again replaces its directory and keeps its
    /// position.
    pub fn register_directory(
        &mut self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), RuntimeError> {
        if name.contains(['\n', '\r']) {
            return Err(RuntimeError::config(format!(
                "preload module name {name:?} contains a line break"
            )));
        }
        let path = path.as_ref();
        let canonical = canonicalize(path)?;
        if !canonical.is_dir() {
            return Err(RuntimeError::config(format!(
                "preload module '{name}' path '{}' is not a directory",
                path.display()
            )));
        }

        debug!(module = name, path = %canonical.display(), "Registered preload module");
        match self.modules.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, dir)) => *dir = canonical,
            None => self.modules.push((name.to_string(), canonical)),
        }
        Ok(())
    }

    /// Collect every file to preload.
    ///
    /// Fails with [`RuntimeError::PathNotFound`] if a registered file,
    /// directory, or symlinked file no longer exists, and with
    /// [`RuntimeError::Config`] for a path the manifest cannot hold.
    pub fn collect(&self) -> Result<Vec<ManifestGroup>, RuntimeError> {
        let mut seen = HashSet::new();
        let mut groups = Vec::with_capacity(self.modules.len() + 1);

        let mut files = Vec::with_capacity(self.files.len());
        for file in &self.files {
            if !file.is_file() {
                return Err(RuntimeError::path_not_found(file));
            }
            listable(file)?;
            if seen.insert(file.clone()) {
                files.push(file.clone());
            }
        }
        groups.push(ManifestGroup {
            module: None,
            files,
        });

        for (name, dir) in &self.modules {
            if !dir.is_dir() {
                return Err(RuntimeError::path_not_found(dir));
            }

            let mut found = Vec::new();
            self.walk(dir, &mut found)?;
            for file in &found {
                listable(file)?;
            }
            found.retain(|file| seen.insert(file.clone()));

            groups.push(ManifestGroup {
                module: Some(name.clone()),
                files: found,
            });
        }

        Ok(groups)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RuntimeError> {
        let mut entries = fs::read_dir(dir)
            .map_err(|e| RuntimeError::io(dir, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RuntimeError::io(dir, e))?;
        entries.sort_by_key(fs::DirEntry::file_name);

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| RuntimeError::io(&path, e))?;

            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if file_type.is_symlink() {
                // Symlinked directories are skipped to stay out of cycles.
                if self.matches(&path) {
                    let target = canonicalize(&path)?;
                    if !target.is_dir() {
                        out.push(target);
                    }
                }
            } else if file_type.is_file() && self.matches(&path) {
                out.push(canonicalize(&path)?);
            }
        }
        Ok(())
    }

    fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(ext))
            })
    }

    /// Render the manifest without writing it.
    pub fn render(&self) -> Result<String, RuntimeError> {
        Ok(render_groups(&self.collect()?))
    }

    /// Write the manifest atomically.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn generate(&self) -> Result<ManifestSummary, RuntimeError> {
        let groups = self.collect()?;
        let contents = render_groups(&groups);
        write_atomic(&self.path, contents.as_bytes())?;

        let summary = ManifestSummary {
            path: self.path.clone(),
            files: groups.iter().map(|group| group.files.len()).sum(),
            modules: groups.iter().filter(|group| group.module.is_some()).count(),
        };
        info!(
            files = summary.files,
            modules = summary.modules,
            "Preload manifest generated"
        );
        Ok(summary)
    }

    /// Manifest contents, generating the manifest first if it is missing.
    pub fn contents(&self) -> Result<String, RuntimeError> {
        if !self.path.is_file() {
            self.generate()?;
        }
        fs::read_to_string(&self.path).map_err(|e| RuntimeError::io(&self.path, e))
    }

    /// Delete the manifest. Returns `false` if there was none.
    pub fn clear(&self) -> Result<bool, RuntimeError> {
        let removed = remove_if_exists(&self.path)?;
        if removed {
            info!(path = %self.path.display(), "Preload manifest cleared");
        }
        Ok(removed)
    }
}

/// Read the paths listed in a manifest, skipping comments.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, RuntimeError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| RuntimeError::io(path, e))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

fn render_groups(groups: &[ManifestGroup]) -> String {
    let mut out = String::from(HEADER);
    for group in groups {
        if let Some(name) = &group.module {
            let _ = writeln!(out, "{MODULE_PREFIX}{name}");
        }
        for file in &group.files {
            let _ = writeln!(out, "{}", file.display());
        }
    }
    out
}

/// A manifest line holds exactly one UTF-8 path.
fn listable(path: &Path) -> Result<(), RuntimeError> {
    match path.to_str() {
        Some(text) if !text.contains(['\n', '\r']) => Ok(()),
        Some(_) => Err(RuntimeError::config(format!(
            "preload path {path:?} contains a line break"
        ))),
        None => Err(RuntimeError::config(format!(
            "preload path {path:?} is not valid UTF-8"
        ))),
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, RuntimeError> {
    fs::canonicalize(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::path_not_found(path)
        } else {
            RuntimeError::io(path, e)
        }
    })
}
