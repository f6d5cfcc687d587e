//! API boundary for the external HTTP/CLI layer.
//!
//! Every call is synchronous from the caller's perspective; internally each
//! one is a request event with a oneshot reply, processed in order by the
//! scheduler's serial event loop. Device listing reads the registry
//! directly since snapshots are already atomic.

use crate::queue::QueueStats;
use crate::registry::{DeviceFilter, DeviceRegistry, DeviceView};
use crate::scheduler::SchedulerEvent;
use crate::task::{TaskSnapshot, TaskSpec};
use salvage_protocol::{DeviceId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Enumerated submission rejections; nothing else surfaces to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitError {
    #[error("task queue is full")]
    QueueFull,
    #[error("coordinator is shutting down")]
    Unavailable,
}

/// Result of `remove_device`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemovedDevice {
    /// In-flight tasks pulled off the device and requeued or failed.
    pub reassigned: usize,
}

/// Cluster-wide counts for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub devices_total: usize,
    pub devices_online: usize,
    pub devices_by_role: BTreeMap<String, u64>,
    pub devices_by_platform: BTreeMap<String, u64>,
    pub queue: QueueStats,
    pub tasks_in_flight: usize,
    pub results_held: usize,
}

/// Requests the boundary posts into the scheduler loop.
pub enum ApiRequest {
    SubmitTask {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<TaskId, SubmitError>>,
    },
    CancelTask {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskSnapshot>>,
    },
    ClusterStats {
        reply: oneshot::Sender<ClusterStats>,
    },
    RemoveDevice {
        device_id: DeviceId,
        reply: oneshot::Sender<Option<RemovedDevice>>,
    },
}

/// Narrow, cloneable handle the external layers hold.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<SchedulerEvent>,
    registry: Arc<DeviceRegistry>,
}

impl CoordinatorHandle {
    pub(crate) fn new(events: mpsc::Sender<SchedulerEvent>, registry: Arc<DeviceRegistry>) -> Self {
        Self { events, registry }
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SchedulerEvent::Api(ApiRequest::SubmitTask { spec, reply }))
            .await
            .map_err(|_| SubmitError::Unavailable)?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    /// Remove a queued task, or request best-effort cancellation of an
    /// in-flight one. False when the task is unknown or already terminal.
    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .events
            .send(SchedulerEvent::Api(ApiRequest::CancelTask { task_id, reply }))
            .await;
        sent.is_ok() && rx.await.unwrap_or(false)
    }

    /// Current snapshot of a task in any state, or None when unknown (or
    /// evicted from the result store).
    pub async fn get_task(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SchedulerEvent::Api(ApiRequest::GetTask { task_id, reply }))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<DeviceView> {
        self.registry.snapshot(filter)
    }

    pub async fn cluster_stats(&self) -> Option<ClusterStats> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SchedulerEvent::Api(ApiRequest::ClusterStats { reply }))
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Forcibly drop a device, reassigning its in-flight tasks. None when
    /// the device id is unknown.
    pub async fn remove_device(&self, device_id: DeviceId) -> Option<RemovedDevice> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SchedulerEvent::Api(ApiRequest::RemoveDevice { device_id, reply }))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_wire_shape() {
        let json = serde_json::to_string(&SubmitError::QueueFull).unwrap();
        assert_eq!(json, r#""queue_full""#);
    }

    #[test]
    fn test_task_spec_minimal_json() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{ "task_type": "echo" }"#).unwrap();
        assert_eq!(spec.task_type, "echo");
        assert!(spec.payload.is_null());
        assert_eq!(spec.priority, salvage_protocol::TaskPriority::Normal);
    }
}
