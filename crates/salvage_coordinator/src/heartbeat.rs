//! Liveness sweepers: periodic timer tasks feeding the scheduler.

use crate::config::HeartbeatConfig;
use crate::metrics::METRICS;
use crate::registry::DeviceRegistry;
use crate::scheduler::{DeviceDownReason, SchedulerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

pub(crate) fn spawn_sweepers(
    registry: Arc<DeviceRegistry>,
    events: mpsc::Sender<SchedulerEvent>,
    config: &HeartbeatConfig,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(stale_device_sweep(
            registry,
            events.clone(),
            config.sweep_interval(),
            config.offline_threshold(),
        )),
        tokio::spawn(task_timeout_sweep(events, config.task_sweep_interval())),
    ]
}

/// Transition devices past the offline threshold to offline, close their
/// sockets, and hand their in-flight tasks to the scheduler.
async fn stale_device_sweep(
    registry: Arc<DeviceRegistry>,
    events: mpsc::Sender<SchedulerEvent>,
    period: Duration,
    threshold: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for (device_id, handle) in registry.sweep_stale(threshold) {
            warn!("device {device_id} silent past the offline threshold, marking offline");
            METRICS.inc_devices_marked_offline();
            if let Some(handle) = handle {
                handle.request_close();
            }
            let event = SchedulerEvent::DeviceDown {
                device_id,
                reason: DeviceDownReason::HeartbeatTimeout,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Nudge the scheduler to expire in-flight tasks past their deadline.
async fn task_timeout_sweep(events: mpsc::Sender<SchedulerEvent>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if events.send(SchedulerEvent::SweepTimeouts).await.is_err() {
            return;
        }
    }
}
