//! Task records and their API-facing views.

use chrono::{DateTime, Utc};
use salvage_protocol::{
    DeviceId, FailureReason, TaskError, TaskId, TaskPriority, TaskRequirements, TaskState,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Submission accepted at the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requirements: TaskRequirements,
}

/// A tracked task.
///
/// Ownership follows the state: the queue owns it while queued, the scheduler
/// while in flight, the result store once terminal. Nothing else mutates it.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub state: TaskState,
    pub assigned_device_id: Option<DeviceId>,
    /// Incremented on every dispatch, including ones that fail to send.
    pub attempts: u32,
    /// 1 + max_retries.
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub failure_reason: Option<FailureReason>,
}

impl Task {
    /// Build a fresh task, resolving omitted requirement fields against the
    /// scheduler defaults.
    pub fn from_spec(spec: TaskSpec, default_timeout_seconds: u64, default_max_retries: u32) -> Self {
        let timeout_seconds = spec
            .requirements
            .timeout_seconds
            .unwrap_or(default_timeout_seconds);
        let max_retries = spec.requirements.max_retries.unwrap_or(default_max_retries);
        Self {
            task_id: TaskId::generate(),
            task_type: spec.task_type,
            payload: spec.payload,
            priority: spec.priority,
            requirements: spec.requirements,
            state: TaskState::Pending,
            assigned_device_id: None,
            attempts: 0,
            max_attempts: max_retries.saturating_add(1),
            timeout_seconds,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            result: None,
            error: None,
            failure_reason: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Serializable view for the API boundary and the result store. The
    /// submission payload is deliberately not echoed back.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            priority: self.priority,
            state: self.state,
            assigned_device_id: self.assigned_device_id.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            timeout_seconds: self.timeout_seconds,
            created_at: self.created_at,
            dispatched_at: self.dispatched_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            error: self.error.clone(),
            failure_reason: self.failure_reason,
        }
    }
}

/// Stable snapshot of a task as seen by API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub assigned_device_id: Option<DeviceId>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub failure_reason: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_spec_resolves_defaults() {
        let spec: TaskSpec =
            serde_json::from_value(json!({ "task_type": "echo", "payload": { "msg": "hi" } }))
                .unwrap();
        let task = Task::from_spec(spec, 300, 3);
        assert_eq!(task.timeout_seconds, 300);
        assert_eq!(task.max_attempts, 4);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.priority, TaskPriority::Normal);
    }

    #[test]
    fn test_from_spec_keeps_explicit_limits() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "task_type": "echo",
            "requirements": { "timeout_seconds": 10, "max_retries": 0 }
        }))
        .unwrap();
        let task = Task::from_spec(spec, 300, 3);
        assert_eq!(task.timeout_seconds, 10);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn test_distinct_ids_for_identical_specs() {
        let spec: TaskSpec =
            serde_json::from_value(json!({ "task_type": "echo" })).unwrap();
        let a = Task::from_spec(spec.clone(), 300, 3);
        let b = Task::from_spec(spec, 300, 3);
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn test_snapshot_omits_payload() {
        let spec: TaskSpec = serde_json::from_value(
            json!({ "task_type": "echo", "payload": { "secret": "blob" } }),
        )
        .unwrap();
        let task = Task::from_spec(spec, 300, 3);
        let value = serde_json::to_value(task.snapshot()).unwrap();
        assert!(value.get("payload").is_none());
    }
}
