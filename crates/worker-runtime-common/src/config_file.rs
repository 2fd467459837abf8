//! Configuration file structures for the worker-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`AdminConfig`]: Admin API settings
//! - [`RouteEntry`]: Static route served by the bundled application

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.pool]
/// workers = 4
/// max_requests = 1000
/// stop_grace_ms = 5000
///
/// [runtime.cache]
/// path = "storage/cache/bootstrap.json"
/// inputs = ["bootstrap.toml"]
/// strategy = "mtime"
///
/// [runtime.preload]
/// manifest_path = "storage/preload.list"
/// extensions = ["js"]
/// files = ["/srv/app/bootstrap.js"]
///
/// [[runtime.preload.modules]]
/// name = "billing"
/// path = "/srv/app/modules/billing"
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
///
/// [[routes]]
/// path = "/"
/// body = "hello"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (pool, cache, preload).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Routes served by the bundled static application.
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable Admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Check if Admin API is properly configured.
    ///
    /// Returns `true` if enabled and token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// A static route served by the bundled application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteEntry {
    /// Exact request path (e.g., "/about").
    pub path: String,

    /// Response status code.
    #[serde(default = "defaults::route_status")]
    pub status: u16,

    /// Response `content-type` header.
    #[serde(default = "defaults::route_content_type")]
    pub content_type: String,

    /// Inline response body.
    #[serde(default)]
    pub body: Option<String>,

    /// File whose contents become the response body.
    ///
    /// Takes precedence over `body`.
    #[serde(default)]
    pub body_file: Option<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }

    pub const fn route_status() -> u16 {
        200
    }

    pub fn route_content_type() -> String {
        "text/plain; charset=utf-8".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FreshnessStrategy;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.graceful_shutdown);
        assert!(!config.admin.enabled);
        assert!(config.admin.token.is_none());
        assert_eq!(config.admin.prefix, "/admin");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:3000"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        // Defaults applied
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.runtime.pool.workers, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.pool]
            workers = 3
            max_requests = 2
            stop_grace_ms = 100

            [runtime.cache]
            path = "/tmp/cache/bootstrap.json"
            inputs = ["bootstrap.toml", "routes.toml"]
            strategy = "content_hash"

            [runtime.preload]
            manifest_path = "/tmp/preload.list"
            extensions = ["js", "mjs"]
            files = ["/srv/app/index.js"]

            [[runtime.preload.modules]]
            name = "billing"
            path = "/srv/app/billing"

            [server]
            bind_addr = "0.0.0.0:9000"
            request_timeout_secs = 60
            graceful_shutdown = false

            [admin]
            enabled = true
            token = "secret-token"
            prefix = "/api/admin"

            [[routes]]
            path = "/"
            body = "hello"

            [[routes]]
            path = "/missing"
            status = 404
            content_type = "application/json"
            body_file = "./missing.json"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.pool.workers, 3);
        assert_eq!(config.runtime.pool.max_requests, 2);
        assert_eq!(config.runtime.cache.inputs.len(), 2);
        assert_eq!(
            config.runtime.cache.strategy,
            FreshnessStrategy::ContentHash
        );
        assert_eq!(config.runtime.preload.extensions, vec!["js", "mjs"]);
        assert_eq!(config.runtime.preload.modules[0].name, "billing");
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert!(!config.server.graceful_shutdown);
        assert!(config.admin.is_configured());
        assert_eq!(config.admin.prefix, "/api/admin");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].status, 200);
        assert_eq!(config.routes[0].content_type, "text/plain; charset=utf-8");
        assert_eq!(config.routes[1].status, 404);
        assert_eq!(config.routes[1].body_file.as_deref(), Some("./missing.json"));
    }

    #[test]
    fn test_admin_config_is_configured() {
        let mut admin = AdminConfig::default();
        assert!(!admin.is_configured());

        admin.enabled = true;
        assert!(!admin.is_configured());

        admin.token = Some("token".to_string());
        assert!(admin.is_configured());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
