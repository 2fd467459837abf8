//! Operator commands.
//!
//! `runtime start` hosts the pool in this process. `runtime stop`,
//! `runtime reload` and `runtime status` talk to a running server through
//! its Admin API. `cache clear` and `preload generate` act on the local
//! artifacts directly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info, warn};

use worker_runtime_common::ConfigFile;
use worker_runtime_server::{ServerConfig, WorkerServer};

use crate::app;
use crate::cli::{AdminArgs, CacheAction, Cli, Command, PreloadAction, RuntimeAction};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = load_config(&cli.config)?;

    match cli.command {
        Command::Runtime { action } => match action {
            RuntimeAction::Start {
                workers,
                max_requests,
                bind,
            } => start(&cli.config, &file, workers, max_requests, bind).await,
            RuntimeAction::Stop(args) => admin(&file, &args, AdminCall::Stop).await,
            RuntimeAction::Reload(args) => admin(&file, &args, AdminCall::Reload).await,
            RuntimeAction::Status(args) => admin(&file, &args, AdminCall::Status).await,
        },
        Command::Cache {
            action: CacheAction::Clear,
        } => clear_cache(&cli.config, &file),
        Command::Preload {
            action: PreloadAction::Generate,
        } => generate_preload(&cli.config, &file),
    }
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<ConfigFile> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ConfigFile::default());
    }

    let file = ConfigFile::from_file(path)?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(file)
}

async fn start(
    config_path: &Path,
    file: &ConfigFile,
    workers: Option<usize>,
    max_requests: Option<u64>,
    bind: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let runtime = Arc::new(app::build_runtime(config_path, file)?);

    let workers = workers.unwrap_or(file.runtime.pool.workers);
    let max_requests = max_requests.unwrap_or(file.runtime.pool.max_requests);
    runtime
        .start(workers, max_requests)
        .await
        .context("failed to start workers")?;

    let mut server_config = ServerConfig::from_file(&file.server)?;
    if let Some(bind) = bind {
        server_config = server_config.with_bind_addr(bind);
    }
    match (&file.admin.token, file.admin.enabled) {
        (Some(token), true) => {
            server_config = server_config.with_admin(file.admin.prefix.clone(), token.clone());
        }
        (None, true) => warn!("Admin API enabled without a token, leaving it disabled"),
        _ => {}
    }

    info!(
        workers,
        max_requests,
        bind_addr = %server_config.bind_addr,
        admin = server_config.admin.is_some(),
        "Server initialized"
    );

    let result = WorkerServer::new(Arc::clone(&runtime), server_config)
        .run()
        .await;
    if result.is_err() {
        runtime.stop().await;
    }
    result.map_err(Into::into)
}

fn clear_cache(config_path: &Path, file: &ConfigFile) -> anyhow::Result<()> {
    let runtime = app::build_runtime(config_path, file)?;

    if runtime.clear_bootstrap_cache()? {
        println!("Bootstrap cache cleared");
    } else {
        println!("Bootstrap cache was already empty");
    }
    Ok(())
}

fn generate_preload(config_path: &Path, file: &ConfigFile) -> anyhow::Result<()> {
    let runtime = app::build_runtime(config_path, file)?;
    let summary = runtime.generate_preload()?;

    println!(
        "Preload manifest written to {} ({} files, {} modules)",
        summary.path.display(),
        summary.files,
        summary.modules
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminCall {
    Stop,
    Reload,
    Status,
}

async fn admin(file: &ConfigFile, args: &AdminArgs, call: AdminCall) -> anyhow::Result<()> {
    let base = admin_url(file, args)?;
    let token = args
        .token
        .clone()
        .or_else(|| file.admin.token.clone())
        .context("no admin token: pass --token or set admin.token")?;

    let client = reqwest::Client::builder()
        .timeout(ADMIN_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let request = match call {
        AdminCall::Stop => client.post(format!("{base}/stop")),
        AdminCall::Reload => client.post(format!("{base}/reload")),
        AdminCall::Status => client.get(format!("{base}/status")),
    };

    let response = request
        .header("X-Admin-Token", token)
        .send()
        .await
        .with_context(|| format!("cannot reach the Admin API at {base}"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("unexpected response from {base} ({status})"))?;

    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("{message} ({status})");
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Base URL of the Admin API, without a trailing slash.
fn admin_url(file: &ConfigFile, args: &AdminArgs) -> anyhow::Result<String> {
    if let Some(url) = &args.url {
        return Ok(url.trim_end_matches('/').to_string());
    }
    if !file.admin.enabled {
        bail!("Admin API is not enabled: set admin.enabled or pass --url");
    }

    let mut addr: SocketAddr = file
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("invalid server.bind_addr '{}'", file.server.bind_addr))?;
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
    }

    let prefix = file.admin.prefix.trim_end_matches('/');
    Ok(format!("http://{addr}{prefix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_admin() -> ConfigFile {
        let mut file = ConfigFile::default();
        file.admin.enabled = true;
        file.admin.token = Some("secret".to_string());
        file
    }

    #[test]
    fn test_admin_url_from_config() {
        let mut file = enabled_admin();
        assert_eq!(
            admin_url(&file, &AdminArgs::default()).unwrap(),
            "http://127.0.0.1:8080/admin"
        );

        file.server.bind_addr = "[::]:9000".to_string();
        file.admin.prefix = "/ops/".to_string();
        assert_eq!(
            admin_url(&file, &AdminArgs::default()).unwrap(),
            "http://[::1]:9000/ops"
        );
    }

    #[test]
    fn test_admin_url_override() {
        let args = AdminArgs {
            url: Some("http://10.0.0.5:8080/admin/".to_string()),
            token: None,
        };
        assert_eq!(
            admin_url(&ConfigFile::default(), &args).unwrap(),
            "http://10.0.0.5:8080/admin"
        );
    }

    #[test]
    fn test_admin_url_requires_enabled_admin() {
        let err = admin_url(&ConfigFile::default(), &AdminArgs::default()).unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(file.runtime.pool.workers, 4);
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[runtime").unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_facility_commands_fail_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("worker-runtime.toml");
        let mut file = ConfigFile::default();
        file.runtime.cache.enabled = false;
        file.runtime.preload.enabled = false;

        assert!(clear_cache(&config_path, &file).is_err());
        assert!(generate_preload(&config_path, &file).is_err());
    }

    #[test]
    fn test_generate_preload_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("index.js");
        std::fs::write(&source, "export default 1;").unwrap();

        let config_path = dir.path().join("worker-runtime.toml");
        let manifest = dir.path().join("preload.list");
        let mut file = ConfigFile::default();
        file.runtime.cache.path = dir.path().join("bootstrap.json").display().to_string();
        file.runtime.preload.manifest_path = manifest.display().to_string();
        file.runtime.preload.files = vec![source.display().to_string()];

        generate_preload(&config_path, &file).unwrap();
        clear_cache(&config_path, &file).unwrap();

        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert!(contents.contains("index.js"));
    }
}
