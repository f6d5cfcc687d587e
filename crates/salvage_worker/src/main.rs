//! Salvage Grid Worker
//!
//! Joins a coordinator, advertises capabilities, and executes tasks.
//!
//! Usage:
//!     salvage-worker --coordinator 192.168.1.10:7711 --tags kitchen,arm

use clap::Parser;
use salvage_logging::{init_logging, LogConfig};
use salvage_worker::{HandlerRegistry, Worker, WorkerConfig};
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "salvage-worker", about = "Worker node for Salvage Grid")]
struct Args {
    /// Coordinator address (host:port)
    #[arg(long, env = "SALVAGE_COORDINATOR", default_value = "127.0.0.1:7711")]
    coordinator: String,

    /// Stable device id; generated when omitted
    #[arg(long, env = "SALVAGE_DEVICE_ID")]
    device_id: Option<String>,

    /// Device role tag (worker, compute, mobile, storage, ...)
    #[arg(long, default_value = "worker")]
    role: String,

    /// Advertised memory in GiB
    #[arg(long, default_value_t = 1.0)]
    memory_gb: f64,

    /// Advertised storage in GiB
    #[arg(long, default_value_t = 8.0)]
    storage_gb: f64,

    /// Advertise a GPU
    #[arg(long)]
    gpu: bool,

    /// Advertise internet access
    #[arg(long)]
    internet: bool,

    /// Comma-separated capability tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(long, default_value_t = 2)]
    max_concurrent: u32,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 60)]
    heartbeat_seconds: u64,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(LogConfig {
        app_name: "salvage-worker",
        verbose: args.verbose,
    })?;

    let device_id = args.device_id.unwrap_or_else(|| {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("worker-{}", &uuid[..8])
    });

    let mut config = WorkerConfig::new(args.coordinator, device_id);
    config.role = args.role;
    config.capabilities.memory_gb = args.memory_gb;
    config.capabilities.storage_gb = args.storage_gb;
    config.capabilities.has_gpu = args.gpu;
    config.capabilities.has_internet = args.internet;
    config.capabilities.tags = args.tags.into_iter().filter(|t| !t.is_empty()).collect();
    config.max_concurrent_tasks = args.max_concurrent;
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_seconds.max(1));

    tracing::info!("starting Salvage Grid worker");
    tracing::info!("  coordinator: {}", config.coordinator_addr);
    tracing::info!("  device id: {}", config.device_id);

    let worker = Worker::connect(config, HandlerRegistry::with_builtins()).await?;
    worker.run().await
}
