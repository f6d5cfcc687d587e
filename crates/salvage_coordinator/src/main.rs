//! Salvage Grid Coordinator
//!
//! Coordinator node: tracks worker devices over TCP and dispatches tasks.
//!
//! Usage:
//!     salvage-coordinator --bind 0.0.0.0:7711

use clap::Parser;
use salvage_coordinator::{Coordinator, CoordinatorConfig, StartError};
use salvage_logging::{init_logging, salvage_home, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;
const EXIT_PERSISTENCE: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "salvage-coordinator", about = "Coordinator node for Salvage Grid")]
struct Args {
    /// TCP listen address for workers (host:port)
    #[arg(long, env = "SALVAGE_BIND")]
    bind: Option<String>,

    /// Registry snapshot path (defaults to ~/.salvage_grid/registry.json)
    #[arg(long, env = "SALVAGE_REGISTRY")]
    registry: Option<PathBuf>,

    /// Append-only task event log path (disabled when omitted)
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Disable registry persistence entirely
    #[arg(long)]
    no_persistence: bool,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = match init_logging(LogConfig {
        app_name: "salvage-coordinator",
        verbose: args.verbose,
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(message) => {
            tracing::error!("{message}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing::info!("starting Salvage Grid coordinator");
    tracing::info!("  bind: {}", config.server.bind_addr());
    match &config.storage.registry_path {
        Some(path) => tracing::info!("  registry: {}", path.display()),
        None => tracing::info!("  registry: persistence disabled"),
    }

    let coordinator = match Coordinator::start(config).await {
        Ok(coordinator) => coordinator,
        Err(err @ StartError::Config(_)) => {
            tracing::error!("{err}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(err @ StartError::Bind { .. }) => {
            tracing::error!("{err}");
            return ExitCode::from(EXIT_BIND);
        }
        Err(err @ StartError::Persistence(_)) => {
            tracing::error!("{err}");
            return ExitCode::from(EXIT_PERSISTENCE);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for shutdown signal: {err}");
    }
    coordinator.shutdown().await;
    ExitCode::SUCCESS
}

fn build_config(args: &Args) -> Result<CoordinatorConfig, String> {
    let mut config = CoordinatorConfig::default();

    if let Some(bind) = &args.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid bind address '{bind}', expected host:port"))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .map_err(|_| format!("invalid port in bind address '{bind}'"))?;
    }

    config.storage.registry_path = if args.no_persistence {
        None
    } else {
        Some(
            args.registry
                .clone()
                .unwrap_or_else(|| salvage_home().join("registry.json")),
        )
    };
    config.storage.event_log_path = args.event_log.clone();

    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}
