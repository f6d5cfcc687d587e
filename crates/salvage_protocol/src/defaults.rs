//! Canonical default values shared by the coordinator and workers.

/// TCP listen address for worker connections.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7711";

/// Cap on concurrent worker sockets.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Maximum size of a single wire frame (JSON line including the newline).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A connection must produce a valid `register` within this window.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: f64 = 10.0;

/// Expected worker heartbeat emission interval (informational).
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: f64 = 60.0;

/// Time since last inbound traffic beyond which a device goes offline.
/// Must stay strictly greater than the heartbeat emission interval.
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: f64 = 300.0;

/// Period of the stale-device sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: f64 = 30.0;

/// Period of the in-flight task timeout sweep.
pub const DEFAULT_TASK_SWEEP_INTERVAL_SECS: f64 = 60.0;

/// Maximum queued (not yet dispatched) tasks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Applied when a submission omits `timeout_seconds`.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Applied when a submission omits `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Result store bounds: newest N terminals, or T seconds, whichever first.
pub const DEFAULT_RESULT_RETENTION_COUNT: usize = 10_000;
pub const DEFAULT_RESULT_RETENTION_SECS: f64 = 86_400.0;

/// Bounded per-connection outbox; overflow drops the connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// `sender_id` used by the coordinator on outbound frames.
pub const COORDINATOR_SENDER_ID: &str = "coordinator";
