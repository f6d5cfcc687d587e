//! Requirement-matching scheduler.
//!
//! A serial processor of events posted by the connection handlers, the
//! sweepers, and the API boundary. It is the only mutator of task state
//! besides queue admission/cancellation and result-store retention, which
//! keeps the lifecycle invariants local: one event, one consistent
//! transition. The queue, the in-flight set, and the result store are owned
//! here outright; only the registry is shared.

use crate::api::{ApiRequest, ClusterStats, RemovedDevice, SubmitError};
use crate::metrics::{ClusterGauges, METRICS};
use crate::persistence::{TaskEvent, TaskEventLog};
use crate::queue::TaskQueue;
use crate::registry::{Candidate, DeviceRegistry};
use crate::results::ResultStore;
use crate::task::{Task, TaskSnapshot, TaskSpec};
use chrono::Utc;
use salvage_protocol::{
    defaults, DeviceId, Envelope, FailureReason, MessageType, TaskAssignPayload, TaskCancelPayload,
    TaskId, TaskResultPayload, TaskState,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a device left the online set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceDownReason {
    /// The socket closed or errored.
    ConnectionClosed,
    /// The heartbeat monitor timed the device out.
    HeartbeatTimeout,
    /// A newer registration for the same id replaced the connection.
    Superseded,
    /// Administrative removal.
    Removed,
}

impl DeviceDownReason {
    fn as_str(&self) -> &'static str {
        match self {
            DeviceDownReason::ConnectionClosed => "connection_closed",
            DeviceDownReason::HeartbeatTimeout => "device_timeout",
            DeviceDownReason::Superseded => "superseded",
            DeviceDownReason::Removed => "removed",
        }
    }
}

/// Everything that can wake the scheduler.
pub(crate) enum SchedulerEvent {
    Api(ApiRequest),
    DeviceUp(DeviceId),
    DeviceDown {
        device_id: DeviceId,
        reason: DeviceDownReason,
    },
    /// Worker acknowledged a `task_assign`; assigned -> running.
    TaskStarted {
        device_id: DeviceId,
        task_id: TaskId,
    },
    TaskResult {
        device_id: DeviceId,
        payload: TaskResultPayload,
    },
    SweepTimeouts,
    Shutdown,
}

pub(crate) struct SchedulerSettings {
    pub queue_capacity: usize,
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub results_capacity: usize,
    pub results_max_age: Duration,
    pub coordinator_id: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            default_timeout_seconds: defaults::DEFAULT_TASK_TIMEOUT_SECS,
            default_max_retries: defaults::DEFAULT_MAX_RETRIES,
            results_capacity: defaults::DEFAULT_RESULT_RETENTION_COUNT,
            results_max_age: Duration::from_secs_f64(defaults::DEFAULT_RESULT_RETENTION_SECS),
            coordinator_id: defaults::COORDINATOR_SENDER_ID.to_string(),
        }
    }
}

struct InFlight {
    task: Task,
    deadline: Instant,
    cancel_requested: bool,
}

pub(crate) struct Scheduler {
    registry: Arc<DeviceRegistry>,
    queue: TaskQueue,
    results: ResultStore,
    in_flight: HashMap<TaskId, InFlight>,
    gauges: Arc<ClusterGauges>,
    event_log: Option<TaskEventLog>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        gauges: Arc<ClusterGauges>,
        event_log: Option<TaskEventLog>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            queue: TaskQueue::new(settings.queue_capacity),
            results: ResultStore::new(settings.results_capacity, settings.results_max_age),
            in_flight: HashMap::new(),
            gauges,
            event_log,
            settings,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<SchedulerEvent>) {
        info!("scheduler event loop started");
        while let Some(event) = events.recv().await {
            if self.handle_event(event) {
                break;
            }
        }
        info!("scheduler stopped");
    }

    /// Process one event; returns true on shutdown.
    fn handle_event(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Api(request) => self.handle_api(request),
            SchedulerEvent::DeviceUp(device_id) => {
                debug!("device {device_id} available, pumping queue");
                self.pump();
            }
            SchedulerEvent::DeviceDown { device_id, reason } => {
                let reassigned = self.reassign_device(&device_id, reason);
                if reassigned > 0 {
                    info!(
                        "device {device_id} down ({}), reassigned {reassigned} in-flight tasks",
                        reason.as_str()
                    );
                    self.pump();
                }
            }
            SchedulerEvent::TaskStarted { device_id, task_id } => {
                self.task_started(&device_id, &task_id);
            }
            SchedulerEvent::TaskResult { device_id, payload } => {
                self.task_result(device_id, payload);
            }
            SchedulerEvent::SweepTimeouts => self.sweep_timeouts(),
            SchedulerEvent::Shutdown => return true,
        }
        self.sync_gauges();
        false
    }

    fn handle_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::SubmitTask { spec, reply } => {
                let _ = reply.send(self.submit(spec));
            }
            ApiRequest::CancelTask { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            ApiRequest::GetTask { task_id, reply } => {
                let _ = reply.send(self.get(&task_id));
            }
            ApiRequest::ClusterStats { reply } => {
                let _ = reply.send(self.stats());
            }
            ApiRequest::RemoveDevice { device_id, reply } => {
                let _ = reply.send(self.remove_device(&device_id));
            }
        }
    }

    fn submit(&mut self, spec: TaskSpec) -> Result<TaskId, SubmitError> {
        let task = Task::from_spec(
            spec,
            self.settings.default_timeout_seconds,
            self.settings.default_max_retries,
        );
        let task_id = task.task_id.clone();
        let task_type = task.task_type.clone();
        let priority = task.priority;
        match self.queue.enqueue(task) {
            Ok(()) => {
                METRICS.inc_tasks_submitted();
                self.log_event(TaskEvent::Submitted {
                    task_id: task_id.clone(),
                    task_type,
                    priority,
                    at: Utc::now(),
                });
                self.pump();
                Ok(task_id)
            }
            Err(_) => Err(SubmitError::QueueFull),
        }
    }

    fn cancel(&mut self, task_id: &TaskId) -> bool {
        if let Some(task) = self.queue.cancel(task_id) {
            info!("task {task_id} cancelled while queued");
            self.finalize(task, TaskState::Cancelled, Some(FailureReason::Cancelled));
            return true;
        }
        if let Some(entry) = self.in_flight.get_mut(task_id) {
            entry.cancel_requested = true;
            // Best-effort: the worker may ignore it; the timeout sweep
            // settles the task either way.
            if let Some(device_id) = entry.task.assigned_device_id.clone() {
                self.post_cancel(&device_id, task_id, "cancelled_by_caller");
            }
            info!("cancel requested for in-flight task {task_id}");
            return true;
        }
        false
    }

    fn get(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        if let Some(snapshot) = self.results.get(task_id) {
            return Some(snapshot);
        }
        if let Some(entry) = self.in_flight.get(task_id) {
            return Some(entry.task.snapshot());
        }
        self.queue.get(task_id).map(Task::snapshot)
    }

    fn stats(&self) -> ClusterStats {
        let registry = self.registry.stats();
        ClusterStats {
            devices_total: registry.total,
            devices_online: registry.online,
            devices_by_role: registry.by_role,
            devices_by_platform: registry.by_platform,
            queue: self.queue.stats(),
            tasks_in_flight: self.in_flight.len(),
            results_held: self.results.len(),
        }
    }

    fn remove_device(&mut self, device_id: &DeviceId) -> Option<RemovedDevice> {
        let handle = self.registry.remove(device_id)?;
        if let Some(handle) = handle {
            handle.request_close();
        }
        let reassigned = self.reassign_device(device_id, DeviceDownReason::Removed);
        info!("device {device_id} removed, {reassigned} in-flight tasks reassigned");
        self.pump();
        Some(RemovedDevice { reassigned })
    }

    /// Pull every in-flight task off a lost device: decrement its counters
    /// for bookkeeping, then retry or fail each task.
    fn reassign_device(&mut self, device_id: &DeviceId, reason: DeviceDownReason) -> usize {
        let task_ids: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.task.assigned_device_id.as_ref() == Some(device_id))
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in &task_ids {
            let Some(entry) = self.in_flight.remove(task_id) else {
                continue;
            };
            self.registry.finish_task(device_id);
            warn!(
                "task {task_id} lost with device {device_id} ({})",
                reason.as_str()
            );
            if entry.cancel_requested {
                self.finalize(entry.task, TaskState::Cancelled, Some(FailureReason::Cancelled));
            } else {
                self.retry_or_finish(
                    entry.task,
                    TaskState::Failed,
                    FailureReason::DeviceLost,
                    true,
                );
            }
        }
        task_ids.len()
    }

    fn task_started(&mut self, device_id: &DeviceId, task_id: &TaskId) {
        match self.in_flight.get_mut(task_id) {
            Some(entry)
                if entry.task.assigned_device_id.as_ref() == Some(device_id)
                    && entry.task.state == TaskState::Assigned =>
            {
                entry.task.state = TaskState::Running;
                debug!("task {task_id} running on {device_id}");
            }
            Some(_) => debug!("stale ack for task {task_id} from {device_id}"),
            None => debug!("ack for unknown task {task_id} from {device_id}"),
        }
    }

    fn task_result(&mut self, device_id: DeviceId, payload: TaskResultPayload) {
        let task_id = payload.task_id.clone();
        let valid = self
            .in_flight
            .get(&task_id)
            .map(|entry| entry.task.assigned_device_id.as_ref() == Some(&device_id))
            .unwrap_or(false);
        if !valid {
            warn!("discarding result for task {task_id} from {device_id}: not assigned there");
            return;
        }
        let mut entry = self
            .in_flight
            .remove(&task_id)
            .unwrap_or_else(|| unreachable!("checked above"));
        self.registry.finish_task(&device_id);

        if payload.status.is_success() {
            entry.task.result = payload.result;
            self.finalize(entry.task, TaskState::Success, None);
        } else {
            // No structured error means the worker could not classify the
            // failure; treat it as transient, bounded by max_attempts.
            let retryable = payload.error.as_ref().map(|e| e.retryable).unwrap_or(true);
            entry.task.error = payload.error;
            if entry.cancel_requested {
                self.finalize(entry.task, TaskState::Cancelled, Some(FailureReason::Cancelled));
            } else {
                self.retry_or_finish(entry.task, TaskState::Failed, FailureReason::Failed, retryable);
            }
        }
        self.pump();
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now >= entry.deadline)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in &expired {
            let Some(entry) = self.in_flight.remove(task_id) else {
                continue;
            };
            let device_id = entry.task.assigned_device_id.clone();
            if let Some(device_id) = &device_id {
                self.registry.finish_task(device_id);
                self.post_cancel(device_id, task_id, "timeout");
            }
            warn!(
                "task {task_id} exceeded its {}s timeout on {}",
                entry.task.timeout_seconds,
                device_id.as_ref().map(|d| d.as_str()).unwrap_or("?")
            );
            if entry.cancel_requested {
                self.finalize(entry.task, TaskState::Cancelled, Some(FailureReason::Cancelled));
            } else {
                self.retry_or_finish(entry.task, TaskState::Timeout, FailureReason::Timeout, true);
            }
        }
        self.results.prune();
        if !expired.is_empty() {
            self.pump();
        }
    }

    /// Re-enqueue at the tail of the original band while attempts remain,
    /// otherwise settle into `terminal_state`.
    fn retry_or_finish(
        &mut self,
        mut task: Task,
        terminal_state: TaskState,
        reason: FailureReason,
        retryable: bool,
    ) {
        if retryable && task.attempts < task.max_attempts {
            debug!(
                "task {} attempt {}/{} failed ({reason}), requeueing",
                task.task_id, task.attempts, task.max_attempts
            );
            task.assigned_device_id = None;
            task.dispatched_at = None;
            METRICS.inc_tasks_retried();
            self.queue.requeue_back(task);
        } else {
            self.finalize(task, terminal_state, Some(reason));
        }
    }

    /// Terminal transition: stamp, count, log, and hand the snapshot to the
    /// result store. Nothing leaves a terminal state afterwards.
    fn finalize(&mut self, mut task: Task, state: TaskState, reason: Option<FailureReason>) {
        debug_assert!(state.is_terminal());
        task.state = state;
        task.finished_at = Some(Utc::now());
        task.failure_reason = reason;
        match state {
            TaskState::Success => METRICS.inc_tasks_completed(),
            TaskState::Failed => METRICS.inc_tasks_failed(),
            TaskState::Cancelled => METRICS.inc_tasks_cancelled(),
            TaskState::Timeout => METRICS.inc_tasks_timed_out(),
            _ => {}
        }
        self.log_event(TaskEvent::Finished {
            task_id: task.task_id.clone(),
            state,
            at: Utc::now(),
        });
        info!("task {} finished: {state}", task.task_id);
        self.results.insert(task.snapshot());
    }

    /// Drain the queue: repeatedly pick the highest-priority, earliest
    /// queued task that has an eligible device and dispatch it. A
    /// higher-priority task with an eligible device is never passed over in
    /// favor of a lower-priority one.
    fn pump(&mut self) {
        loop {
            let registry = &self.registry;
            let Some(task) = self
                .queue
                .take_first_matching(|t| {
                    !registry.find_candidates(&t.task_type, &t.requirements).is_empty()
                })
            else {
                break;
            };

            // Re-resolve for ranking; the registry may have shifted since
            // the predicate ran.
            let candidates = self
                .registry
                .find_candidates(&task.task_type, &task.requirements);
            let affinity: HashSet<DeviceId> = self
                .in_flight
                .values()
                .filter(|entry| entry.task.task_type == task.task_type)
                .filter_map(|entry| entry.task.assigned_device_id.clone())
                .collect();
            let Some(device_id) = select_device(&task, candidates, &affinity) else {
                self.queue.requeue_front(task);
                break;
            };
            self.dispatch(task, device_id);
        }
    }

    /// queued -> assigned. Atomically claims device concurrency, increments
    /// attempts, and posts the assignment; a failed post reverts everything
    /// except the attempt counter and returns the task to the head of its
    /// band.
    fn dispatch(&mut self, mut task: Task, device_id: DeviceId) {
        let Some(handle) = self.registry.begin_dispatch(&device_id) else {
            self.queue.requeue_front(task);
            return;
        };

        task.attempts += 1;
        task.state = TaskState::Assigned;
        task.assigned_device_id = Some(device_id.clone());
        task.dispatched_at = Some(Utc::now());

        let assign = TaskAssignPayload {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            timeout_seconds: task.timeout_seconds,
            attempt: task.attempts,
        };
        let envelope = Envelope::new(
            MessageType::TaskAssign,
            self.settings.coordinator_id.as_str(),
            &assign,
        );
        let posted = match envelope {
            Ok(envelope) => handle.post(envelope).map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        };

        match posted {
            Ok(()) => {
                let deadline = Instant::now() + task.timeout();
                METRICS.inc_tasks_dispatched();
                self.log_event(TaskEvent::Dispatched {
                    task_id: task.task_id.clone(),
                    device_id: device_id.clone(),
                    attempt: task.attempts,
                    at: Utc::now(),
                });
                info!(
                    "task {} -> {device_id} (attempt {}/{})",
                    task.task_id, task.attempts, task.max_attempts
                );
                self.in_flight.insert(
                    task.task_id.clone(),
                    InFlight {
                        task,
                        deadline,
                        cancel_requested: false,
                    },
                );
            }
            Err(err) => {
                warn!("dispatch to {device_id} failed ({err}), requeueing at head of band");
                self.registry.finish_task(&device_id);
                // The connection is already doomed; detach it now so the
                // next pump iteration cannot pick the same device.
                if let Some(stale) = self.registry.force_detach(&device_id) {
                    stale.request_close();
                }
                task.assigned_device_id = None;
                task.dispatched_at = None;
                // The failed send counts as an attempt, so exhaustion here
                // is terminal too.
                if task.attempts >= task.max_attempts {
                    self.finalize(task, TaskState::Failed, Some(FailureReason::DeviceLost));
                } else {
                    self.queue.requeue_front(task);
                }
                self.reassign_device(&device_id, DeviceDownReason::ConnectionClosed);
            }
        }
    }

    fn post_cancel(&self, device_id: &DeviceId, task_id: &TaskId, reason: &str) {
        let Some(handle) = self.registry.handle_of(device_id) else {
            return;
        };
        let payload = TaskCancelPayload {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        };
        match Envelope::new(
            MessageType::TaskCancel,
            self.settings.coordinator_id.as_str(),
            &payload,
        ) {
            Ok(envelope) => {
                if let Err(err) = handle.post(envelope) {
                    debug!("task_cancel for {task_id} not delivered: {err}");
                }
            }
            Err(err) => warn!("failed to encode task_cancel: {err}"),
        }
    }

    fn log_event(&self, event: TaskEvent) {
        if let Some(log) = &self.event_log {
            log.append(event);
        }
    }

    fn sync_gauges(&self) {
        self.gauges.set_tasks_queued(self.queue.len() as u64);
        self.gauges.set_tasks_in_flight(self.in_flight.len() as u64);
    }
}

/// Rank eligible devices for a task.
///
/// Preferred device wins outright when eligible. Otherwise: lowest
/// active_task_count first; among equal loads a device already running the
/// same task type gets a weak affinity edge, then highest headroom, then
/// lexicographic device id for reproducibility.
fn select_device(
    task: &Task,
    mut candidates: Vec<Candidate>,
    same_type_in_flight: &HashSet<DeviceId>,
) -> Option<DeviceId> {
    if candidates.is_empty() {
        return None;
    }
    if let Some(preferred) = &task.requirements.preferred_device_id {
        if candidates.iter().any(|c| &c.device_id == preferred) {
            return Some(preferred.clone());
        }
    }
    candidates.sort_by(|a, b| {
        a.active_task_count
            .cmp(&b.active_task_count)
            .then_with(|| {
                let a_affinity = same_type_in_flight.contains(&a.device_id);
                let b_affinity = same_type_in_flight.contains(&b.device_id);
                b_affinity.cmp(&a_affinity)
            })
            .then_with(|| {
                headroom(b)
                    .partial_cmp(&headroom(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
    candidates.first().map(|c| c.device_id.clone())
}

/// Free cpu cores plus free memory scaled at roughly one core per 4 GiB.
fn headroom(candidate: &Candidate) -> f64 {
    let free_cpu = candidate.cpu_cores as f64 * (1.0 - candidate.cpu_percent / 100.0);
    let free_mem = candidate.memory_gb * (1.0 - candidate.memory_percent / 100.0) / 4.0;
    free_cpu + free_mem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::loopback_handle;
    use salvage_protocol::{
        DeviceCapabilities, Platform, RegisterPayload, TaskError, TaskOutcome, TaskRequirements,
    };
    use serde_json::json;
    use tokio::sync::oneshot;

    fn profile(device_id: &str, task_types: &[&str], max_concurrent: u32) -> RegisterPayload {
        RegisterPayload {
            device_id: DeviceId::new(device_id),
            role: "worker".to_string(),
            platform: Platform::Linux,
            architecture: "x86_64".to_string(),
            runtime_version: "0.1.0".to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores: 4,
                memory_gb: 8.0,
                storage_gb: 64.0,
                has_gpu: false,
                has_internet: true,
                tags: Default::default(),
            },
            supported_task_types: task_types.iter().map(|s| s.to_string()).collect(),
            max_concurrent_tasks: max_concurrent,
        }
    }

    fn scheduler_with(settings: SchedulerSettings) -> Scheduler {
        let gauges = Arc::new(ClusterGauges::new());
        let registry = Arc::new(DeviceRegistry::new(gauges.clone()));
        Scheduler::new(registry, gauges, None, settings)
    }

    fn spec(task_type: &str) -> TaskSpec {
        serde_json::from_value(json!({ "task_type": task_type })).unwrap()
    }

    fn spec_with(task_type: &str, requirements: serde_json::Value) -> TaskSpec {
        serde_json::from_value(json!({ "task_type": task_type, "requirements": requirements }))
            .unwrap()
    }

    fn api_submit(scheduler: &mut Scheduler, spec: TaskSpec) -> Result<TaskId, SubmitError> {
        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::SubmitTask { spec, reply }));
        rx.try_recv().expect("reply sent synchronously")
    }

    fn api_get(scheduler: &mut Scheduler, task_id: &TaskId) -> Option<TaskSnapshot> {
        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::GetTask {
            task_id: task_id.clone(),
            reply,
        }));
        rx.try_recv().expect("reply sent synchronously")
    }

    fn fail_result(task_id: &TaskId, retryable: bool) -> TaskResultPayload {
        TaskResultPayload {
            task_id: task_id.clone(),
            status: TaskOutcome::Failure,
            result: None,
            error: Some(TaskError {
                code: "boom".to_string(),
                message: "it broke".to_string(),
                retryable,
            }),
            execution_time_seconds: 0.1,
        }
    }

    #[tokio::test]
    async fn test_submit_dispatch_complete() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);

        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();

        let envelope = outbox.try_recv().expect("assignment posted");
        assert_eq!(envelope.message_type, MessageType::TaskAssign);
        let assign: TaskAssignPayload = envelope.decode_data().unwrap();
        assert_eq!(assign.task_id, task_id);
        assert_eq!(assign.attempt, 1);

        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Assigned);
        assert_eq!(
            scheduler.registry.active_task_count(&DeviceId::new("w1")),
            Some(1)
        );

        scheduler.handle_event(SchedulerEvent::TaskStarted {
            device_id: DeviceId::new("w1"),
            task_id: task_id.clone(),
        });
        assert_eq!(
            api_get(&mut scheduler, &task_id).unwrap().state,
            TaskState::Running
        );

        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("w1"),
            payload: TaskResultPayload {
                task_id: task_id.clone(),
                status: TaskOutcome::Success,
                result: Some(json!({ "echoed": "hi" })),
                error: None,
                execution_time_seconds: 0.5,
            },
        });

        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Success);
        assert_eq!(snapshot.result, Some(json!({ "echoed": "hi" })));
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(
            scheduler.registry.active_task_count(&DeviceId::new("w1")),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_no_eligible_device_waits_queued() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Queued);
        assert!(snapshot.assigned_device_id.is_none());
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let mut scheduler = scheduler_with(SchedulerSettings {
            queue_capacity: 1,
            ..Default::default()
        });
        api_submit(&mut scheduler, spec("echo")).unwrap();
        assert_eq!(
            api_submit(&mut scheduler, spec("echo")),
            Err(SubmitError::QueueFull)
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_keeps_last_error() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["flaky"], 2), None, handle);

        let task_id = api_submit(
            &mut scheduler,
            spec_with("flaky", json!({ "max_retries": 1 })),
        )
        .unwrap();

        // Attempt 1 fails retryable -> requeued and immediately re-dispatched.
        outbox.try_recv().expect("attempt 1 posted");
        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("w1"),
            payload: fail_result(&task_id, true),
        });
        let second = outbox.try_recv().expect("attempt 2 posted");
        let assign: TaskAssignPayload = second.decode_data().unwrap();
        assert_eq!(assign.attempt, 2);

        // Attempt 2 fails: retries exhausted.
        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("w1"),
            payload: fail_result(&task_id, true),
        });
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.failure_reason, Some(FailureReason::Failed));
        assert_eq!(snapshot.error.unwrap().code, "boom");
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);
        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        outbox.try_recv().expect("dispatched");

        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("w1"),
            payload: fail_result(&task_id, false),
        });
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.attempts, 1);
    }

    #[tokio::test]
    async fn test_unknown_result_discarded() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, _outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);
        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("w1"),
            payload: fail_result(&TaskId::from("ghost"), true),
        });
        assert_eq!(
            scheduler.registry.active_task_count(&DeviceId::new("w1")),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_result_from_wrong_device_discarded() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);
        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        outbox.try_recv().expect("dispatched");

        scheduler.handle_event(SchedulerEvent::TaskResult {
            device_id: DeviceId::new("intruder"),
            payload: fail_result(&task_id, true),
        });
        assert_eq!(
            api_get(&mut scheduler, &task_id).unwrap().state,
            TaskState::Assigned
        );
    }

    #[tokio::test]
    async fn test_device_down_requeues_then_redispatches() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle_a, mut outbox_a) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle_a);
        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        outbox_a.try_recv().expect("dispatched to w1");

        scheduler.registry.force_detach(&DeviceId::new("w1"));
        scheduler.handle_event(SchedulerEvent::DeviceDown {
            device_id: DeviceId::new("w1"),
            reason: DeviceDownReason::HeartbeatTimeout,
        });
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Queued);
        assert_eq!(
            scheduler.registry.active_task_count(&DeviceId::new("w1")),
            Some(0)
        );

        let (handle_b, mut outbox_b) = loopback_handle(2);
        scheduler
            .registry
            .register(profile("w2", &["echo"], 2), None, handle_b);
        scheduler.handle_event(SchedulerEvent::DeviceUp(DeviceId::new("w2")));

        let envelope = outbox_b.try_recv().expect("re-dispatched to w2");
        let assign: TaskAssignPayload = envelope.decode_data().unwrap();
        assert_eq!(assign.task_id, task_id);
        assert_eq!(assign.attempt, 2);
    }

    #[tokio::test]
    async fn test_dispatch_post_failure_reverts_and_detaches() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, outbox) = loopback_handle(1);
        drop(outbox); // posting will fail with Closed
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);

        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        // Reverted to queued; the failed send still counts as an attempt.
        assert_eq!(snapshot.state, TaskState::Queued);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(
            scheduler.registry.active_task_count(&DeviceId::new("w1")),
            Some(0)
        );
        assert!(scheduler
            .registry
            .find_candidates("echo", &TaskRequirements::default())
            .is_empty());
    }

    #[tokio::test]
    async fn test_timeout_sweep_retries_then_times_out() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["slow"], 2), None, handle);

        let task_id = api_submit(
            &mut scheduler,
            spec_with("slow", json!({ "timeout_seconds": 0, "max_retries": 1 })),
        )
        .unwrap();
        outbox.try_recv().expect("attempt 1");

        // Attempt 1 expires -> retried (attempts 1 < max_attempts 2).
        scheduler.handle_event(SchedulerEvent::SweepTimeouts);
        let cancel = outbox.try_recv().expect("task_cancel for attempt 1");
        assert_eq!(cancel.message_type, MessageType::TaskCancel);
        let reassign = outbox.try_recv().expect("attempt 2");
        assert_eq!(reassign.message_type, MessageType::TaskAssign);

        // Attempt 2 expires -> terminal timeout.
        scheduler.handle_event(SchedulerEvent::SweepTimeouts);
        let snapshot = api_get(&mut scheduler, &task_id).unwrap();
        assert_eq!(snapshot.state, TaskState::Timeout);
        assert_eq!(snapshot.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(snapshot.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_in_flight() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());

        // Queued: removed immediately, terminal cancelled.
        let queued_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::CancelTask {
            task_id: queued_id.clone(),
            reply,
        }));
        assert!(rx.try_recv().unwrap());
        assert_eq!(
            api_get(&mut scheduler, &queued_id).unwrap().state,
            TaskState::Cancelled
        );

        // In flight: best-effort cancel posted, settled by the sweep.
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);
        let flying_id = api_submit(
            &mut scheduler,
            spec_with("echo", json!({ "timeout_seconds": 0 })),
        )
        .unwrap();
        outbox.try_recv().expect("dispatched");
        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::CancelTask {
            task_id: flying_id.clone(),
            reply,
        }));
        assert!(rx.try_recv().unwrap());
        assert_eq!(
            outbox.try_recv().unwrap().message_type,
            MessageType::TaskCancel
        );
        scheduler.handle_event(SchedulerEvent::SweepTimeouts);
        assert_eq!(
            api_get(&mut scheduler, &flying_id).unwrap().state,
            TaskState::Cancelled
        );

        // Unknown id.
        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::CancelTask {
            task_id: TaskId::from("ghost"),
            reply,
        }));
        assert!(!rx.try_recv().unwrap());
    }

    #[tokio::test]
    async fn test_remove_device_reassigns() {
        let mut scheduler = scheduler_with(SchedulerSettings::default());
        let (handle, mut outbox) = loopback_handle(1);
        scheduler
            .registry
            .register(profile("w1", &["echo"], 2), None, handle);
        let task_id = api_submit(&mut scheduler, spec("echo")).unwrap();
        outbox.try_recv().expect("dispatched");

        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::RemoveDevice {
            device_id: DeviceId::new("w1"),
            reply,
        }));
        let removed = rx.try_recv().unwrap().expect("device existed");
        assert_eq!(removed.reassigned, 1);
        assert_eq!(
            api_get(&mut scheduler, &task_id).unwrap().state,
            TaskState::Queued
        );

        let (reply, mut rx) = oneshot::channel();
        scheduler.handle_event(SchedulerEvent::Api(ApiRequest::RemoveDevice {
            device_id: DeviceId::new("w1"),
            reply,
        }));
        assert!(rx.try_recv().unwrap().is_none());
    }

    fn candidate(device_id: &str, active: u32, cpu_percent: f64) -> Candidate {
        Candidate {
            device_id: DeviceId::new(device_id),
            active_task_count: active,
            cpu_cores: 4,
            memory_gb: 8.0,
            cpu_percent,
            memory_percent: 50.0,
        }
    }

    #[test]
    fn test_select_lowest_load_wins() {
        let task = Task::from_spec(spec("echo"), 300, 3);
        let picked = select_device(
            &task,
            vec![candidate("busy", 2, 0.0), candidate("idle", 0, 90.0)],
            &HashSet::new(),
        );
        assert_eq!(picked, Some(DeviceId::new("idle")));
    }

    #[test]
    fn test_select_headroom_breaks_load_ties() {
        let task = Task::from_spec(spec("echo"), 300, 3);
        let picked = select_device(
            &task,
            vec![candidate("hot", 1, 95.0), candidate("cool", 1, 5.0)],
            &HashSet::new(),
        );
        assert_eq!(picked, Some(DeviceId::new("cool")));
    }

    #[test]
    fn test_select_lexicographic_final_tie_break() {
        let task = Task::from_spec(spec("echo"), 300, 3);
        let picked = select_device(
            &task,
            vec![candidate("w2", 0, 10.0), candidate("w1", 0, 10.0)],
            &HashSet::new(),
        );
        assert_eq!(picked, Some(DeviceId::new("w1")));
    }

    #[test]
    fn test_select_affinity_only_on_equal_load() {
        let task = Task::from_spec(spec("echo"), 300, 3);
        let affinity: HashSet<DeviceId> = [DeviceId::new("w2")].into_iter().collect();

        // Equal load: affinity wins over lexicographic order.
        let picked = select_device(
            &task,
            vec![candidate("w1", 1, 10.0), candidate("w2", 1, 10.0)],
            &affinity,
        );
        assert_eq!(picked, Some(DeviceId::new("w2")));

        // Unequal load: affinity must not override the lowest-load rule.
        let picked = select_device(
            &task,
            vec![candidate("w1", 0, 10.0), candidate("w2", 1, 10.0)],
            &affinity,
        );
        assert_eq!(picked, Some(DeviceId::new("w1")));
    }

    #[test]
    fn test_select_preferred_device_overrides() {
        let mut task = Task::from_spec(spec("echo"), 300, 3);
        task.requirements.preferred_device_id = Some(DeviceId::new("busy"));
        let picked = select_device(
            &task,
            vec![candidate("busy", 2, 0.0), candidate("idle", 0, 0.0)],
            &HashSet::new(),
        );
        assert_eq!(picked, Some(DeviceId::new("busy")));

        // Preferred device ineligible: soft affinity is simply ignored.
        task.requirements.preferred_device_id = Some(DeviceId::new("ghost"));
        let picked = select_device(&task, vec![candidate("idle", 0, 0.0)], &HashSet::new());
        assert_eq!(picked, Some(DeviceId::new("idle")));
    }
}
