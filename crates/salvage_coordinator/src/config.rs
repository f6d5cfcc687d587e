//! Coordinator configuration.
//!
//! Plain data with serde defaults; file parsing belongs to the outer CLI
//! layer. Every duration is expressed in seconds and validated before start.

use salvage_protocol::defaults;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive, finite number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error(
        "heartbeat.offline_threshold_seconds ({threshold}) must be strictly greater than \
         heartbeat.interval_seconds ({interval})"
    )]
    ThresholdTooLow { threshold: f64, interval: f64 },

    #[error("{field} must be greater than zero")]
    InvalidCount { field: &'static str },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub scheduler: SchedulerConfig,
    pub results: ResultsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub handshake_timeout_seconds: f64,
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let (host, port) = split_bind_addr(defaults::DEFAULT_BIND_ADDR);
        Self {
            host,
            port,
            max_connections: defaults::DEFAULT_MAX_CONNECTIONS,
            max_frame_bytes: defaults::DEFAULT_MAX_FRAME_BYTES,
            handshake_timeout_seconds: defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            outbox_capacity: defaults::DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Expected worker emission interval; informational, scheduling does not
    /// depend on it.
    pub interval_seconds: f64,
    pub offline_threshold_seconds: f64,
    pub sweep_interval_seconds: f64,
    pub task_sweep_interval_seconds: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            offline_threshold_seconds: defaults::DEFAULT_OFFLINE_THRESHOLD_SECS,
            sweep_interval_seconds: defaults::DEFAULT_SWEEP_INTERVAL_SECS,
            task_sweep_interval_seconds: defaults::DEFAULT_TASK_SWEEP_INTERVAL_SECS,
        }
    }
}

impl HeartbeatConfig {
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.offline_threshold_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_seconds)
    }

    pub fn task_sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.task_sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub default_task_timeout_seconds: u64,
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            default_task_timeout_seconds: defaults::DEFAULT_TASK_TIMEOUT_SECS,
            default_max_retries: defaults::DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub retention_count: usize,
    pub retention_seconds: f64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            retention_count: defaults::DEFAULT_RESULT_RETENTION_COUNT,
            retention_seconds: defaults::DEFAULT_RESULT_RETENTION_SECS,
        }
    }
}

impl ResultsConfig {
    pub fn retention_age(&self) -> Duration {
        Duration::from_secs_f64(self.retention_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Registry snapshot location. None disables registry persistence.
    pub registry_path: Option<PathBuf>,
    /// Append-only task event log. None disables the log.
    pub event_log_path: Option<PathBuf>,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            (
                "server.handshake_timeout_seconds",
                self.server.handshake_timeout_seconds,
            ),
            ("heartbeat.interval_seconds", self.heartbeat.interval_seconds),
            (
                "heartbeat.offline_threshold_seconds",
                self.heartbeat.offline_threshold_seconds,
            ),
            (
                "heartbeat.sweep_interval_seconds",
                self.heartbeat.sweep_interval_seconds,
            ),
            (
                "heartbeat.task_sweep_interval_seconds",
                self.heartbeat.task_sweep_interval_seconds,
            ),
            ("results.retention_seconds", self.results.retention_seconds),
        ];
        for (field, value) in durations {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidDuration { field, value });
            }
        }

        if self.heartbeat.offline_threshold_seconds <= self.heartbeat.interval_seconds {
            return Err(ConfigError::ThresholdTooLow {
                threshold: self.heartbeat.offline_threshold_seconds,
                interval: self.heartbeat.interval_seconds,
            });
        }

        let counts = [
            ("server.max_connections", self.server.max_connections),
            ("server.max_frame_bytes", self.server.max_frame_bytes),
            ("server.outbox_capacity", self.server.outbox_capacity),
            ("scheduler.queue_capacity", self.scheduler.queue_capacity),
            ("results.retention_count", self.results.retention_count),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::InvalidCount { field });
            }
        }

        Ok(())
    }
}

fn split_bind_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(defaults_port()),
        ),
        None => (addr.to_string(), defaults_port()),
    }
}

fn defaults_port() -> u16 {
    7711
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_bind_addr() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.server.bind_addr(), defaults::DEFAULT_BIND_ADDR);
    }

    #[test]
    fn test_threshold_must_exceed_interval() {
        let mut config = CoordinatorConfig::default();
        config.heartbeat.interval_seconds = 60.0;
        config.heartbeat.offline_threshold_seconds = 60.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdTooLow { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_queue() {
        let mut config = CoordinatorConfig::default();
        config.scheduler.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCount { .. })
        ));
    }

    #[test]
    fn test_rejects_nonfinite_duration() {
        let mut config = CoordinatorConfig::default();
        config.heartbeat.sweep_interval_seconds = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial_overrides() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{ "server": { "port": 9000 }, "scheduler": { "queue_capacity": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.scheduler.queue_capacity, 5);
        assert_eq!(
            config.scheduler.default_max_retries,
            defaults::DEFAULT_MAX_RETRIES
        );
    }
}
