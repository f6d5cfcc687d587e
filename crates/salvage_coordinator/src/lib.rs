//! Salvage Grid coordinator.
//!
//! Organizes idle devices into a cooperative compute cluster: workers join
//! over TCP, advertise capabilities, heartbeat, and execute dispatched
//! tasks. This crate is the coordinator's core — device registry, wire
//! handler, priority queue, scheduler, result store — behind a narrow API
//! boundary for the external HTTP/CLI layers.

pub mod api;
pub mod config;
mod connection;
mod heartbeat;
pub mod metrics;
mod persistence;
pub mod queue;
pub mod registry;
mod results;
mod scheduler;
mod server;
pub mod task;

pub use api::{ClusterStats, CoordinatorHandle, RemovedDevice, SubmitError};
pub use config::{ConfigError, CoordinatorConfig};
pub use registry::{DeviceFilter, DeviceView};
pub use task::{TaskSnapshot, TaskSpec};

use crate::connection::ConnectionContext;
use crate::metrics::{ClusterGauges, METRICS};
use crate::persistence::{RegistryStore, TaskEventLog};
use crate::registry::DeviceRegistry;
use crate::scheduler::{Scheduler, SchedulerEvent, SchedulerSettings};
use salvage_protocol::{defaults, FrameCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Internal event channel depth; handlers back-pressure on it.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Failures that abort startup. The binary maps each variant to its exit
/// code; runtime persistence failures only log.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to restore persisted state: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A running coordinator: scheduler loop, sweepers, persistence flusher,
/// and the accept loop.
pub struct Coordinator {
    handle: CoordinatorHandle,
    local_addr: SocketAddr,
    events: mpsc::Sender<SchedulerEvent>,
    registry: Arc<DeviceRegistry>,
    store: Option<RegistryStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Validate config, restore persisted state, bind, and spawn the
    /// runtime tasks.
    pub async fn start(config: CoordinatorConfig) -> Result<Coordinator, StartError> {
        config.validate()?;

        let gauges = Arc::new(ClusterGauges::new());
        let registry = Arc::new(DeviceRegistry::new(gauges.clone()));

        let store = config.storage.registry_path.clone().map(RegistryStore::new);
        if let Some(store) = &store {
            let devices = store.load().map_err(StartError::Persistence)?;
            if !devices.is_empty() {
                info!(
                    "restored {} devices from {} (all offline)",
                    devices.len(),
                    store.path().display()
                );
            }
            registry.restore(devices);
        }
        let event_log = match &config.storage.event_log_path {
            Some(path) => Some(
                TaskEventLog::spawn(path.clone()).map_err(StartError::Persistence)?,
            ),
            None => None,
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let scheduler = Scheduler::new(
            registry.clone(),
            gauges.clone(),
            event_log,
            SchedulerSettings {
                queue_capacity: config.scheduler.queue_capacity,
                default_timeout_seconds: config.scheduler.default_task_timeout_seconds,
                default_max_retries: config.scheduler.default_max_retries,
                results_capacity: config.results.retention_count,
                results_max_age: config.results.retention_age(),
                coordinator_id: defaults::COORDINATOR_SENDER_ID.to_string(),
            },
        );
        let mut tasks = vec![tokio::spawn(scheduler.run(events_rx))];
        tasks.extend(heartbeat::spawn_sweepers(
            registry.clone(),
            events_tx.clone(),
            &config.heartbeat,
        ));
        if let Some(store) = store.clone() {
            tasks.push(tokio::spawn(registry_flusher(
                registry.clone(),
                store,
                config.heartbeat.sweep_interval(),
            )));
        }

        let addr = config.server.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| StartError::Bind {
            addr,
            source,
        })?;

        let ctx = ConnectionContext {
            registry: registry.clone(),
            events: events_tx.clone(),
            gauges,
            codec: FrameCodec::new(config.server.max_frame_bytes),
            handshake_timeout: config.server.handshake_timeout(),
            outbox_capacity: config.server.outbox_capacity,
            coordinator_id: defaults::COORDINATOR_SENDER_ID.to_string(),
        };
        tasks.push(tokio::spawn(server::run_accept_loop(
            listener,
            ctx,
            config.server.max_connections,
        )));

        info!("coordinator listening on {local_addr}");
        Ok(Coordinator {
            handle: CoordinatorHandle::new(events_tx.clone(), registry.clone()),
            local_addr,
            events: events_tx,
            registry,
            store,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Stop the runtime tasks and flush a final registry snapshot.
    pub async fn shutdown(mut self) {
        info!("coordinator shutting down");
        let _ = self.events.send(SchedulerEvent::Shutdown).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(store) = &self.store {
            let devices = self.registry.export();
            let store = store.clone();
            let result =
                tokio::task::spawn_blocking(move || store.save(&devices)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    METRICS.inc_persistence_errors();
                    error!("final registry snapshot failed: {err:#}");
                }
                Err(err) => error!("final registry snapshot panicked: {err}"),
            }
        }
        info!("coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Periodically write the registry snapshot when membership changed.
/// Failures are logged; in-memory state stays authoritative.
async fn registry_flusher(
    registry: Arc<DeviceRegistry>,
    store: RegistryStore,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !registry.take_dirty() {
            continue;
        }
        let devices = registry.export();
        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&devices)).await;
        if let Ok(Err(err)) = result {
            METRICS.inc_persistence_errors();
            warn!("registry snapshot failed: {err:#}");
        }
    }
}
