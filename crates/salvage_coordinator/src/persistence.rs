//! Durable state: registry snapshot file and the append-only task event log.
//!
//! Persistence is best-effort at runtime: failures are logged and counted,
//! and in-memory state stays authoritative.

use crate::metrics::METRICS;
use crate::registry::PersistedDevice;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use salvage_protocol::{DeviceId, TaskId, TaskPriority, TaskState};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    devices: Vec<PersistedDevice>,
}

/// JSON snapshot of the device registry, written atomically via tmp+rename.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the snapshot; a missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<PersistedDevice>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read(&self.path)
            .with_context(|| format!("Failed to read registry snapshot {}", self.path.display()))?;
        let snapshot: SnapshotFile = serde_json::from_slice(&raw).with_context(|| {
            format!("Failed to parse registry snapshot {}", self.path.display())
        })?;
        Ok(snapshot.devices)
    }

    pub fn save(&self, devices: &[PersistedDevice]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot directory {}", parent.display())
            })?;
        }
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            devices: devices.to_vec(),
        };
        let raw = serde_json::to_vec_pretty(&snapshot).context("Failed to encode snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .with_context(|| format!("Failed to write snapshot {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace snapshot {}", self.path.display()))?;
        debug!("registry snapshot saved ({} devices)", devices.len());
        Ok(())
    }
}

/// One line in the append-only task audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        task_type: String,
        priority: TaskPriority,
        at: DateTime<Utc>,
    },
    Dispatched {
        task_id: TaskId,
        device_id: DeviceId,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Finished {
        task_id: TaskId,
        state: TaskState,
        at: DateTime<Utc>,
    },
}

/// Append-only JSONL writer on a dedicated thread, fed over a channel so the
/// scheduler never blocks on disk.
pub struct TaskEventLog {
    tx: mpsc::Sender<TaskEvent>,
}

impl TaskEventLog {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create event log directory {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;

        let (tx, rx) = mpsc::channel::<TaskEvent>();
        thread::Builder::new()
            .name("salvage-event-log".to_string())
            .spawn(move || append_loop(file, rx))
            .context("Failed to spawn event log thread")?;
        Ok(Self { tx })
    }

    /// Best-effort append; a dead writer thread is ignored.
    pub fn append(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

fn append_loop(file: File, rx: mpsc::Receiver<TaskEvent>) {
    let mut writer = BufWriter::new(file);
    while let Ok(event) = rx.recv() {
        let line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to encode task event: {err}");
                METRICS.inc_persistence_errors();
                continue;
            }
        };
        if writer
            .write_all(&line)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .is_err()
        {
            METRICS.inc_persistence_errors();
            warn!("task event log write failed; continuing without it");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salvage_protocol::{DeviceCapabilities, Platform, RegisterPayload};
    use tempfile::TempDir;

    fn persisted(device_id: &str) -> PersistedDevice {
        PersistedDevice {
            profile: RegisterPayload {
                device_id: DeviceId::new(device_id),
                role: "worker".to_string(),
                platform: Platform::Linux,
                architecture: "aarch64".to_string(),
                runtime_version: "0.1.0".to_string(),
                capabilities: DeviceCapabilities::default(),
                supported_task_types: vec!["echo".to_string()],
                max_concurrent_tasks: 1,
            },
            registered_at: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("nested").join("registry.json"));
        store.save(&[persisted("w1"), persisted("w2")]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].profile.device_id, DeviceId::new("w1"));
    }

    #[test]
    fn test_load_rejects_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(RegistryStore::new(path).load().is_err());
    }

    #[test]
    fn test_event_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = TaskEventLog::spawn(path.clone()).unwrap();
        log.append(TaskEvent::Submitted {
            task_id: TaskId::from("t1"),
            task_type: "echo".to_string(),
            priority: TaskPriority::Normal,
            at: Utc::now(),
        });
        log.append(TaskEvent::Finished {
            task_id: TaskId::from("t1"),
            state: TaskState::Success,
            at: Utc::now(),
        });
        // The writer thread flushes per line; give it a moment.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let contents = fs::read_to_string(&path).unwrap_or_default();
            if contents.lines().count() == 2 {
                assert!(contents.contains("\"event\":\"submitted\""));
                assert!(contents.contains("\"event\":\"finished\""));
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "event log never flushed"
            );
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }
}
