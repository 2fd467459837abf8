//! Static site application hosted by the binary.
//!
//! The `[[routes]]` section of the config file is assembled into a
//! [`RouteTable`] once, by the bootstrap step. The config file and every
//! `body_file` are the bootstrap cache inputs, so editing any of them
//! invalidates the cached table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use worker_runtime_common::{BoxError, ConfigFile, RouteEntry};
use worker_runtime_core::{DispatchContext, EntryPoint, Request, Response, Runtime};

/// A fully resolved route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Routes by exact request path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    routes: BTreeMap<String, StaticRoute>,
}

impl RouteTable {
    /// Resolve route entries, reading body files relative to `base`.
    pub fn assemble(entries: &[RouteEntry], base: &Path) -> anyhow::Result<Self> {
        let mut routes = BTreeMap::new();

        for entry in entries {
            let body = match &entry.body_file {
                Some(file) => {
                    let path = base.join(file);
                    std::fs::read_to_string(&path).with_context(|| {
                        format!("route {}: cannot read {}", entry.path, path.display())
                    })?
                }
                None => entry.body.clone().unwrap_or_default(),
            };

            routes.insert(
                entry.path.clone(),
                StaticRoute {
                    status: entry.status,
                    content_type: entry.content_type.clone(),
                    body,
                },
            );
        }

        Ok(Self { routes })
    }

    pub fn get(&self, path: &str) -> Option<&StaticRoute> {
        self.routes.get(path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Serves a [`RouteTable`]. Only `GET` and `HEAD` are allowed.
#[derive(Debug, Default)]
pub struct StaticSite;

impl EntryPoint for StaticSite {
    type App = RouteTable;

    fn initialize(&self, app: &RouteTable, slot: usize) -> Result<(), BoxError> {
        if app.is_empty() {
            warn!(slot, "No routes configured, every request will get 404");
        } else {
            debug!(slot, routes = app.len(), "Static site ready");
        }
        Ok(())
    }

    fn dispatch(
        &self,
        app: &RouteTable,
        _ctx: &DispatchContext,
        request: Request,
    ) -> Result<Response, BoxError> {
        let head = request.method.eq_ignore_ascii_case("HEAD");
        if !head && !request.method.eq_ignore_ascii_case("GET") {
            return Ok(Response::text(405, "Method Not Allowed").with_header("allow", "GET, HEAD"));
        }

        let response = match app.get(request.path()) {
            Some(route) => Response::new(route.status, route.body.as_bytes())
                .with_header("content-type", &route.content_type),
            None => Response::text(404, "Not Found"),
        };

        if head {
            return Ok(Response {
                body: Vec::new(),
                ..response
            });
        }
        Ok(response)
    }
}

/// Directory that relative `body_file` paths are resolved against.
pub fn config_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Files whose change must invalidate the cached route table.
pub fn cache_inputs(config_path: &Path, file: &ConfigFile) -> Vec<PathBuf> {
    let base = config_dir(config_path);
    let mut inputs = Vec::new();

    if config_path.exists() {
        inputs.push(config_path.to_path_buf());
    }
    inputs.extend(
        file.routes
            .iter()
            .filter_map(|route| route.body_file.as_ref())
            .map(|body_file| base.join(body_file)),
    );
    inputs.extend(file.runtime.cache.inputs.iter().map(PathBuf::from));

    inputs.sort();
    inputs.dedup();
    inputs
}

/// Build the runtime that hosts the static site described by `file`.
pub fn build_runtime(config_path: &Path, file: &ConfigFile) -> anyhow::Result<Runtime<StaticSite>> {
    let mut config = file.runtime.clone();
    config.cache.inputs = cache_inputs(config_path, file)
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();

    let entries = file.routes.clone();
    let base = config_dir(config_path);
    let assemble = move || -> Result<RouteTable, BoxError> {
        RouteTable::assemble(&entries, &base).map_err(Into::into)
    };

    Runtime::new(config, StaticSite, assemble).context("invalid runtime configuration")
}
