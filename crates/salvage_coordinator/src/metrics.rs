//! Metrics Module for Observability
//!
//! In-memory metrics for monitoring coordinator health and performance.
//! Plain data, lock-free atomics, single writer per counter site.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance - lock-free atomics for counters
pub static METRICS: Metrics = Metrics::new();

/// Coordinator metrics - all fields are atomic for thread-safe access
pub struct Metrics {
    // Task counters
    pub tasks_submitted: AtomicU64,
    pub tasks_dispatched: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_timed_out: AtomicU64,

    // Device counters
    pub devices_registered: AtomicU64,
    pub devices_marked_offline: AtomicU64,

    // Connection counters
    pub connections_accepted: AtomicU64,
    pub connections_refused: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,

    // Error counters
    pub protocol_errors: AtomicU64,
    pub persistence_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            tasks_timed_out: AtomicU64::new(0),
            devices_registered: AtomicU64::new(0),
            devices_marked_offline: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_tasks_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_devices_registered(&self) {
        self.devices_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_devices_marked_offline(&self) {
        self.devices_marked_offline.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connections_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_persistence_errors(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            devices_registered: self.devices_registered.load(Ordering::Relaxed),
            devices_marked_offline: self.devices_marked_offline.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("salvage_tasks_submitted_total", "Tasks accepted at the API boundary", s.tasks_submitted),
            ("salvage_tasks_dispatched_total", "Task dispatches sent to workers", s.tasks_dispatched),
            ("salvage_tasks_completed_total", "Tasks finished successfully", s.tasks_completed),
            ("salvage_tasks_failed_total", "Tasks that reached the failed state", s.tasks_failed),
            ("salvage_tasks_retried_total", "Task attempts re-enqueued after a retryable failure", s.tasks_retried),
            ("salvage_tasks_cancelled_total", "Tasks cancelled before completion", s.tasks_cancelled),
            ("salvage_tasks_timed_out_total", "Tasks that reached the timeout state", s.tasks_timed_out),
            ("salvage_devices_registered_total", "Successful device registrations", s.devices_registered),
            ("salvage_devices_marked_offline_total", "Devices transitioned offline by the heartbeat sweep", s.devices_marked_offline),
            ("salvage_connections_accepted_total", "Worker sockets accepted", s.connections_accepted),
            ("salvage_connections_refused_total", "Worker sockets refused at the connection cap", s.connections_refused),
            ("salvage_messages_received_total", "Wire messages received", s.messages_received),
            ("salvage_messages_sent_total", "Wire messages sent", s.messages_sent),
            ("salvage_protocol_errors_total", "Wire protocol violations", s.protocol_errors),
            ("salvage_persistence_errors_total", "Persistence failures (logged and ignored)", s.persistence_errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub tasks_timed_out: u64,
    pub devices_registered: u64,
    pub devices_marked_offline: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub protocol_errors: u64,
    pub persistence_errors: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Tasks: {} submitted, {} dispatched, {} completed, {} failed, {} retried | \
             Devices: {} registered, {} offlined | \
             Wire: {} in, {} out, {} protocol errors",
            self.tasks_submitted,
            self.tasks_dispatched,
            self.tasks_completed,
            self.tasks_failed,
            self.tasks_retried,
            self.devices_registered,
            self.devices_marked_offline,
            self.messages_received,
            self.messages_sent,
            self.protocol_errors,
        )
    }
}

/// Shared cluster gauges, written by the scheduler and registry and read by
/// heartbeat acks and status replies without touching either.
#[derive(Debug, Default)]
pub struct ClusterGauges {
    tasks_queued: AtomicU64,
    tasks_in_flight: AtomicU64,
    devices_online: AtomicU64,
}

impl ClusterGauges {
    pub const fn new() -> Self {
        Self {
            tasks_queued: AtomicU64::new(0),
            tasks_in_flight: AtomicU64::new(0),
            devices_online: AtomicU64::new(0),
        }
    }

    pub fn set_tasks_queued(&self, value: u64) {
        self.tasks_queued.store(value, Ordering::Relaxed);
    }

    pub fn tasks_queued(&self) -> u64 {
        self.tasks_queued.load(Ordering::Relaxed)
    }

    pub fn set_tasks_in_flight(&self, value: u64) {
        self.tasks_in_flight.store(value, Ordering::Relaxed);
    }

    pub fn tasks_in_flight(&self) -> u64 {
        self.tasks_in_flight.load(Ordering::Relaxed)
    }

    pub fn set_devices_online(&self, value: u64) {
        self.devices_online.store(value, Ordering::Relaxed);
    }

    pub fn devices_online(&self) -> u64 {
        self.devices_online.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();
        metrics.inc_tasks_dispatched();
        metrics.inc_tasks_dispatched();
        metrics.inc_tasks_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_dispatched, 2);
        assert_eq!(snapshot.tasks_completed, 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_tasks_completed();
        let output = metrics.prometheus_format();
        assert!(output.contains("salvage_tasks_completed_total 1"));
        assert!(output.contains("# TYPE salvage_tasks_submitted_total counter"));
    }

    #[test]
    fn test_gauges_roundtrip() {
        let gauges = ClusterGauges::new();
        gauges.set_tasks_queued(7);
        gauges.set_devices_online(3);
        assert_eq!(gauges.tasks_queued(), 7);
        assert_eq!(gauges.devices_online(), 3);
        assert_eq!(gauges.tasks_in_flight(), 0);
    }
}
