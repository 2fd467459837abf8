//! Command line definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Multi-worker application server runtime.
#[derive(Debug, Parser)]
#[command(name = "worker-runtime", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "WORKER_RUNTIME_CONFIG",
        default_value = "worker-runtime.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the worker pool
    Runtime {
        #[command(subcommand)]
        action: RuntimeAction,
    },
    /// Manage the bootstrap cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Manage the preload manifest
    Preload {
        #[command(subcommand)]
        action: PreloadAction,
    },
}

/// Worker pool subcommands.
#[derive(Debug, Subcommand)]
pub enum RuntimeAction {
    /// Start the workers and serve HTTP until stopped
    Start {
        /// Number of workers (defaults to `runtime.pool.workers`)
        workers: Option<usize>,
        /// Requests per worker before it recycles (defaults to `runtime.pool.max_requests`)
        max_requests: Option<u64>,
        /// Address to bind, overriding `server.bind_addr`
        #[arg(long, env = "WORKER_RUNTIME_BIND_ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Stop a running server
    Stop(AdminArgs),
    /// Reload every worker of a running server, one at a time
    Reload(AdminArgs),
    /// Show the status of a running server
    Status(AdminArgs),
}

/// How to reach the Admin API of a running server.
#[derive(Debug, Clone, Default, Args)]
pub struct AdminArgs {
    /// Admin API base URL (defaults to `server.bind_addr` + `admin.prefix`)
    #[arg(long, env = "WORKER_RUNTIME_ADMIN_URL")]
    pub url: Option<String>,
    /// Admin token (defaults to `admin.token`)
    #[arg(long, env = "WORKER_RUNTIME_ADMIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Bootstrap cache subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Delete the cached application
    Clear,
}

/// Preload manifest subcommands.
#[derive(Debug, Subcommand)]
pub enum PreloadAction {
    /// Write the preload manifest
    Generate,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_with_counts() {
        let cli = Cli::try_parse_from(["worker-runtime", "runtime", "start", "3", "50"]).unwrap();

        match cli.command {
            Command::Runtime {
                action:
                    RuntimeAction::Start {
                        workers,
                        max_requests,
                        bind,
                    },
            } => {
                assert_eq!(workers, Some(3));
                assert_eq!(max_requests, Some(50));
                assert!(bind.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_admin_command() {
        let cli = Cli::try_parse_from([
            "worker-runtime",
            "--config",
            "/etc/app.toml",
            "runtime",
            "reload",
            "--token",
            "secret",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/app.toml"));
        assert!(matches!(
            cli.command,
            Command::Runtime {
                action: RuntimeAction::Reload(AdminArgs { token: Some(_), .. })
            }
        ));
    }

    #[test]
    fn test_parse_facility_commands() {
        let cli = Cli::try_parse_from(["worker-runtime", "cache", "clear"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Cache {
                action: CacheAction::Clear
            }
        ));

        let cli = Cli::try_parse_from(["worker-runtime", "preload", "generate"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Preload {
                action: PreloadAction::Generate
            }
        ));
    }

    #[test]
    fn test_rejects_non_numeric_workers() {
        assert!(Cli::try_parse_from(["worker-runtime", "runtime", "start", "many"]).is_err());
    }
}
