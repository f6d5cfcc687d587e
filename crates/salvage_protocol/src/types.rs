//! Protocol payload types and canonical enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Canonical identifiers
// ============================================================================

/// Stable device identifier, chosen by the worker and kept across reconnects.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fallback id for workers that register without one.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("device-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Coordinator-assigned task identifier, globally unique.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Canonical enums (used across all crates)
// ============================================================================

/// Device liveness status. A registered device is never forgotten unless
/// explicitly removed; it merely transitions offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceStatus::Online)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            _ => Err(format!("Invalid device status: '{}'", s)),
        }
    }
}

/// Worker operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Macos,
    Android,
    #[default]
    Other,
}

impl Platform {
    pub const ALL: &'static [Platform] = &[
        Platform::Linux,
        Platform::Windows,
        Platform::Macos,
        Platform::Android,
        Platform::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Android => "android",
            Platform::Other => "other",
        }
    }

    /// Best-effort mapping from `std::env::consts::OS`.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            "macos" => Platform::Macos,
            "android" => Platform::Android,
            _ => Platform::Other,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            "macos" | "darwin" => Ok(Platform::Macos),
            "android" => Ok(Platform::Android),
            "other" => Ok(Platform::Other),
            _ => Err(format!("Invalid platform: '{}'", s)),
        }
    }
}

/// Scheduling priority. Four bands; within a band, FIFO by submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Highest band first.
    pub const ALL: &'static [TaskPriority] = &[
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub const BAND_COUNT: usize = 4;

    /// Band index, 0 = urgent.
    pub fn band(&self) -> usize {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(TaskPriority::Urgent),
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!("Invalid task priority: '{}'", s)),
        }
    }
}

/// Task lifecycle state. This is the CANONICAL definition - use this
/// everywhere a task state is stored or reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Accepted but not yet admitted to the queue.
    #[default]
    Pending,
    /// Waiting in a priority band for an eligible device.
    Queued,
    /// Dispatched; covers the window from send to first worker ack.
    Assigned,
    /// Worker acknowledged and is executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed with retries exhausted or a non-retryable error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Exceeded its timeout with retries exhausted.
    Timeout,
}

impl TaskState {
    pub const ALL: &'static [TaskState] = &[
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Assigned,
        TaskState::Running,
        TaskState::Success,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Timeout => "timeout",
        }
    }

    /// No task ever transitions out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Cancelled | TaskState::Timeout
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "queued" => Ok(TaskState::Queued),
            "assigned" => Ok(TaskState::Assigned),
            "running" => Ok(TaskState::Running),
            "success" => Ok(TaskState::Success),
            "failed" => Ok(TaskState::Failed),
            "cancelled" | "canceled" => Ok(TaskState::Cancelled),
            "timeout" => Ok(TaskState::Timeout),
            _ => Err(format!("Invalid task state: '{}'", s)),
        }
    }
}

/// Worker-reported outcome inside a `task_result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// Bounded, enumerated reason attached to terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Failed,
    Timeout,
    Cancelled,
    DeviceLost,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Failed => "failed",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::DeviceLost => "device_lost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Capabilities and requirements
// ============================================================================

/// Hardware capabilities advertised at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceCapabilities {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub has_gpu: bool,
    pub has_internet: bool,
    pub tags: BTreeSet<String>,
}

/// Requirements a device must satisfy to receive a task.
///
/// `timeout_seconds` and `max_retries` resolve against the coordinator's
/// configured defaults when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskRequirements {
    pub min_cpu_cores: u32,
    pub min_memory_gb: f64,
    pub min_storage_gb: f64,
    pub required_platform: Option<Platform>,
    pub required_role: Option<String>,
    pub required_tags: BTreeSet<String>,
    pub gpu_required: bool,
    pub internet_required: bool,
    /// Soft affinity: honored when that device is eligible, ignored otherwise.
    pub preferred_device_id: Option<DeviceId>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

impl TaskRequirements {
    /// Capability half of the eligibility predicate: does this device profile
    /// meet the declared minima and flags? Liveness, task-type support, and
    /// concurrency caps are checked by the registry.
    pub fn satisfied_by(&self, profile: &RegisterPayload) -> bool {
        let caps = &profile.capabilities;
        if caps.cpu_cores < self.min_cpu_cores {
            return false;
        }
        if caps.memory_gb < self.min_memory_gb {
            return false;
        }
        if caps.storage_gb < self.min_storage_gb {
            return false;
        }
        if let Some(platform) = self.required_platform {
            if profile.platform != platform {
                return false;
            }
        }
        if let Some(role) = &self.required_role {
            if &profile.role != role {
                return false;
            }
        }
        if !self.required_tags.is_subset(&caps.tags) {
            return false;
        }
        if self.gpu_required && !caps.has_gpu {
            return false;
        }
        if self.internet_required && !caps.has_internet {
            return false;
        }
        true
    }
}

// ============================================================================
// message_type = register / register_ack
// ============================================================================

/// Worker -> Coordinator: handshake with identity and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub device_id: DeviceId,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
}

fn default_role() -> String {
    "worker".to_string()
}

fn default_max_concurrent() -> u32 {
    1
}

impl RegisterPayload {
    /// `"*"` advertises every task type.
    pub fn supports_task_type(&self, task_type: &str) -> bool {
        self.supported_task_types
            .iter()
            .any(|t| t == "*" || t == task_type)
    }
}

/// Coordinator -> Worker: registration outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub assigned_device_id: DeviceId,
}

// ============================================================================
// message_type = heartbeat / heartbeat_ack
// ============================================================================

/// Worker -> Coordinator: periodic liveness signal with rolling metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HeartbeatPayload {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_tasks: u32,
    pub uptime_seconds: u64,
}

/// Coordinator -> Worker: heartbeat reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub server_time: DateTime<Utc>,
    /// How many queued tasks are waiting cluster-wide.
    pub pending_task_hint: u32,
}

// ============================================================================
// message_type = task_assign / task_result / task_cancel
// ============================================================================

/// Coordinator -> Worker: execute this task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignPayload {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub timeout_seconds: u64,
    pub attempt: u32,
}

/// Worker-supplied error detail inside a failed `task_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Worker -> Coordinator: terminal report for an assigned task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: TaskId,
    pub status: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub execution_time_seconds: f64,
}

/// Coordinator -> Worker: best-effort cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub task_id: TaskId,
    pub reason: String,
}

// ============================================================================
// message_type = status_query / status_reply / error
// ============================================================================

/// Worker -> Coordinator inside a `status_reply`: acknowledges that an
/// assigned task has started executing. Correlated to the `task_assign` by
/// `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub task_id: TaskId,
}

/// Worker -> Coordinator: diagnostic probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatusQueryPayload {}

/// Coordinator -> Worker inside a `status_reply` answering a `status_query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusPayload {
    pub server_time: DateTime<Utc>,
    pub devices_online: u64,
    pub tasks_queued: u64,
    pub tasks_in_flight: u64,
}

/// Bidirectional error notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}
