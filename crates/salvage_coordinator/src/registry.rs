//! Device registry: the authoritative map of known devices.
//!
//! All operations are compound and atomic under a single readers-writer
//! lock. The registry enforces the "at most one online device per id"
//! invariant itself: a colliding registration evicts the previous handle and
//! hands it back to the caller for closing, so no lock is held across I/O.

use crate::connection::ConnectionHandle;
use crate::metrics::ClusterGauges;
use chrono::{DateTime, Utc};
use salvage_protocol::{
    DeviceCapabilities, DeviceId, DeviceStatus, HeartbeatPayload, Platform, RegisterPayload,
    TaskRequirements,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// One known device. Never forgotten unless explicitly removed; offline
/// devices keep their metadata and can re-attach on the next register.
#[derive(Debug)]
struct Device {
    profile: RegisterPayload,
    address: Option<SocketAddr>,
    status: DeviceStatus,
    registered_at: DateTime<Utc>,
    last_seen: Instant,
    last_seen_wall: DateTime<Utc>,
    active_task_count: u32,
    cpu_percent: f64,
    memory_percent: f64,
    uptime_seconds: u64,
    handle: Option<ConnectionHandle>,
}

impl Device {
    fn new(profile: RegisterPayload, address: Option<SocketAddr>, handle: ConnectionHandle) -> Self {
        Self {
            profile,
            address,
            status: DeviceStatus::Online,
            registered_at: Utc::now(),
            last_seen: Instant::now(),
            last_seen_wall: Utc::now(),
            active_task_count: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            uptime_seconds: 0,
            handle: Some(handle),
        }
    }

    fn view(&self, device_id: &DeviceId) -> DeviceView {
        DeviceView {
            device_id: device_id.clone(),
            role: self.profile.role.clone(),
            platform: self.profile.platform,
            architecture: self.profile.architecture.clone(),
            runtime_version: self.profile.runtime_version.clone(),
            capabilities: self.profile.capabilities.clone(),
            supported_task_types: self.profile.supported_task_types.clone(),
            max_concurrent_tasks: self.profile.max_concurrent_tasks,
            address: self.address.map(|a| a.to_string()),
            status: self.status,
            registered_at: self.registered_at,
            last_seen: self.last_seen_wall,
            active_task_count: self.active_task_count,
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            uptime_seconds: self.uptime_seconds,
        }
    }
}

/// Serializable view of a device for the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: DeviceId,
    pub role: String,
    pub platform: Platform,
    pub architecture: String,
    pub runtime_version: String,
    pub capabilities: DeviceCapabilities,
    pub supported_task_types: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub address: Option<String>,
    pub status: DeviceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active_task_count: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime_seconds: u64,
}

/// Snapshot filter for `list_devices`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    pub role: Option<String>,
    pub platform: Option<Platform>,
    pub tags: BTreeSet<String>,
}

impl DeviceFilter {
    fn matches(&self, device: &Device) -> bool {
        if let Some(status) = self.status {
            if device.status != status {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if &device.profile.role != role {
                return false;
            }
        }
        if let Some(platform) = self.platform {
            if device.profile.platform != platform {
                return false;
            }
        }
        self.tags.is_subset(&device.profile.capabilities.tags)
    }
}

/// Ranking inputs for one eligible device.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub device_id: DeviceId,
    pub active_task_count: u32,
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Registry counts for cluster stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub online: usize,
    pub by_role: BTreeMap<String, u64>,
    pub by_platform: BTreeMap<String, u64>,
}

/// Device record as written to the registry snapshot file. Restored devices
/// always come back offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub profile: RegisterPayload,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct DeviceRegistry {
    inner: RwLock<HashMap<DeviceId, Device>>,
    gauges: Arc<ClusterGauges>,
    dirty: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(gauges: Arc<ClusterGauges>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            gauges,
            dirty: AtomicBool::new(false),
        }
    }

    /// Insert or re-attach a device. Returns `was_new` plus the evicted
    /// handle when the id was already online on a different connection; the
    /// caller must request close on it outside the lock.
    pub fn register(
        &self,
        profile: RegisterPayload,
        address: Option<SocketAddr>,
        handle: ConnectionHandle,
    ) -> (bool, Option<ConnectionHandle>) {
        let device_id = profile.device_id.clone();
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let (was_new, evicted) = match map.get_mut(&device_id) {
            None => {
                map.insert(device_id, Device::new(profile, address, handle));
                (true, None)
            }
            Some(device) => {
                let evicted = match device.handle.take() {
                    Some(old) if old.conn_id() != handle.conn_id() => Some(old),
                    _ => None,
                };
                device.profile = profile;
                device.address = address;
                device.status = DeviceStatus::Online;
                device.last_seen = Instant::now();
                device.last_seen_wall = Utc::now();
                device.handle = Some(handle);
                (false, evicted)
            }
        };
        self.refresh_online_gauge(&map);
        self.dirty.store(true, Ordering::Relaxed);
        (was_new, evicted)
    }

    /// Record a heartbeat: freshen last_seen and the rolling load metrics.
    pub fn touch(&self, device_id: &DeviceId, heartbeat: &HeartbeatPayload) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(device) = map.get_mut(device_id) else {
            return false;
        };
        device.last_seen = Instant::now();
        device.last_seen_wall = Utc::now();
        device.cpu_percent = clamp_percent(heartbeat.cpu_percent);
        device.memory_percent = clamp_percent(heartbeat.memory_percent);
        device.uptime_seconds = heartbeat.uptime_seconds;
        true
    }

    /// Freshen last_seen on any inbound message.
    pub fn touch_seen(&self, device_id: &DeviceId) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = map.get_mut(device_id) {
            device.last_seen = Instant::now();
            device.last_seen_wall = Utc::now();
        }
    }

    /// Mark offline, but only if `conn_id` is still the attached connection.
    /// A handler superseded by a newer registration detaches as a no-op.
    pub fn detach(&self, device_id: &DeviceId, conn_id: u64) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(device) = map.get_mut(device_id) else {
            return false;
        };
        if device.handle.as_ref().map(ConnectionHandle::conn_id) != Some(conn_id) {
            return false;
        }
        device.handle = None;
        device.status = DeviceStatus::Offline;
        self.refresh_online_gauge(&map);
        true
    }

    /// Mark offline unconditionally, returning the detached handle. Used
    /// when a dispatch post fails and the connection is already doomed.
    pub fn force_detach(&self, device_id: &DeviceId) -> Option<ConnectionHandle> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let device = map.get_mut(device_id)?;
        let handle = device.handle.take();
        device.status = DeviceStatus::Offline;
        self.refresh_online_gauge(&map);
        handle
    }

    /// Forcibly drop a device. Returns its handle (if any) for closing, or
    /// None when the id is unknown.
    pub fn remove(&self, device_id: &DeviceId) -> Option<Option<ConnectionHandle>> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let device = map.remove(device_id)?;
        self.refresh_online_gauge(&map);
        self.dirty.store(true, Ordering::Relaxed);
        Some(device.handle)
    }

    /// Transition every online device that has been silent for at least
    /// `threshold` to offline. Returns the swept ids and their handles.
    pub fn sweep_stale(&self, threshold: Duration) -> Vec<(DeviceId, Option<ConnectionHandle>)> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut swept = Vec::new();
        for (device_id, device) in map.iter_mut() {
            if device.status.is_online() && now.duration_since(device.last_seen) >= threshold {
                device.status = DeviceStatus::Offline;
                swept.push((device_id.clone(), device.handle.take()));
            }
        }
        if !swept.is_empty() {
            self.refresh_online_gauge(&map);
        }
        swept
    }

    /// Cheap copy-on-read snapshot.
    pub fn snapshot(&self, filter: &DeviceFilter) -> Vec<DeviceView> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut views: Vec<DeviceView> = map
            .iter()
            .filter(|(_, device)| filter.matches(device))
            .map(|(device_id, device)| device.view(device_id))
            .collect();
        views.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        views
    }

    /// All online devices that can accept this task right now: capability
    /// minima, platform/role/tags/flags, an advertised handler for the task
    /// type, and spare concurrency under the advertised cap.
    pub fn find_candidates(&self, task_type: &str, reqs: &TaskRequirements) -> Vec<Candidate> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|(_, device)| {
                device.status.is_online()
                    && device.handle.is_some()
                    && device.active_task_count < device.profile.max_concurrent_tasks
                    && device.profile.supports_task_type(task_type)
                    && reqs.satisfied_by(&device.profile)
            })
            .map(|(device_id, device)| Candidate {
                device_id: device_id.clone(),
                active_task_count: device.active_task_count,
                cpu_cores: device.profile.capabilities.cpu_cores,
                memory_gb: device.profile.capabilities.memory_gb,
                cpu_percent: device.cpu_percent,
                memory_percent: device.memory_percent,
            })
            .collect()
    }

    /// Atomically claim one unit of device concurrency and return the handle
    /// to post on. None when the device went offline in the meantime.
    pub fn begin_dispatch(&self, device_id: &DeviceId) -> Option<ConnectionHandle> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let device = map.get_mut(device_id)?;
        if !device.status.is_online() {
            return None;
        }
        let handle = device.handle.clone()?;
        device.active_task_count += 1;
        Some(handle)
    }

    /// Release one unit of device concurrency. Also applied to offline
    /// devices so reassignment keeps the bookkeeping consistent.
    pub fn finish_task(&self, device_id: &DeviceId) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = map.get_mut(device_id) {
            device.active_task_count = device.active_task_count.saturating_sub(1);
        }
    }

    pub fn handle_of(&self, device_id: &DeviceId) -> Option<ConnectionHandle> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(device_id).and_then(|device| device.handle.clone())
    }

    pub fn active_task_count(&self, device_id: &DeviceId) -> Option<u32> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(device_id).map(|device| device.active_task_count)
    }

    pub fn stats(&self) -> RegistryStats {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = RegistryStats {
            total: map.len(),
            ..Default::default()
        };
        for device in map.values() {
            if device.status.is_online() {
                stats.online += 1;
            }
            *stats.by_role.entry(device.profile.role.clone()).or_insert(0) += 1;
            *stats
                .by_platform
                .entry(device.profile.platform.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    pub fn export(&self) -> Vec<PersistedDevice> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut devices: Vec<PersistedDevice> = map
            .values()
            .map(|device| PersistedDevice {
                profile: device.profile.clone(),
                registered_at: device.registered_at,
                last_seen: device.last_seen_wall,
            })
            .collect();
        devices.sort_by(|a, b| a.profile.device_id.cmp(&b.profile.device_id));
        devices
    }

    /// Load a persisted snapshot; every device comes back offline with no
    /// handle and zeroed counters.
    pub fn restore(&self, devices: Vec<PersistedDevice>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for persisted in devices {
            let device_id = persisted.profile.device_id.clone();
            map.insert(
                device_id,
                Device {
                    profile: persisted.profile,
                    address: None,
                    status: DeviceStatus::Offline,
                    registered_at: persisted.registered_at,
                    last_seen: Instant::now(),
                    last_seen_wall: persisted.last_seen,
                    active_task_count: 0,
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    uptime_seconds: 0,
                    handle: None,
                },
            );
        }
    }

    /// True once since the last call if membership or metadata changed.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    fn refresh_online_gauge(&self, map: &HashMap<DeviceId, Device>) {
        let online = map.values().filter(|d| d.status.is_online()).count();
        self.gauges.set_devices_online(online as u64);
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::loopback_handle;

    fn profile(device_id: &str, cpu: u32) -> RegisterPayload {
        RegisterPayload {
            device_id: DeviceId::new(device_id),
            role: "worker".to_string(),
            platform: Platform::Linux,
            architecture: "x86_64".to_string(),
            runtime_version: "0.1.0".to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores: cpu,
                memory_gb: 8.0,
                storage_gb: 64.0,
                has_gpu: false,
                has_internet: true,
                tags: BTreeSet::new(),
            },
            supported_task_types: vec!["echo".to_string()],
            max_concurrent_tasks: 2,
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(ClusterGauges::new()))
    }

    #[test]
    fn test_register_new_then_reattach() {
        let registry = registry();
        let (handle_a, _rx_a) = loopback_handle(1);
        let (was_new, evicted) = registry.register(profile("w1", 4), None, handle_a);
        assert!(was_new);
        assert!(evicted.is_none());

        assert!(registry.detach(&DeviceId::new("w1"), 1));
        let offline = registry.snapshot(&DeviceFilter {
            status: Some(DeviceStatus::Offline),
            ..Default::default()
        });
        assert_eq!(offline.len(), 1);

        let (handle_b, _rx_b) = loopback_handle(2);
        let (was_new, evicted) = registry.register(profile("w1", 4), None, handle_b);
        assert!(!was_new);
        assert!(evicted.is_none(), "offline device has no handle to evict");
    }

    #[test]
    fn test_duplicate_registration_evicts_old_handle() {
        let registry = registry();
        let (handle_a, _rx_a) = loopback_handle(1);
        let (handle_b, _rx_b) = loopback_handle(2);
        registry.register(profile("w1", 4), None, handle_a);
        let (was_new, evicted) = registry.register(profile("w1", 4), None, handle_b);
        assert!(!was_new);
        assert_eq!(evicted.map(|h| h.conn_id()), Some(1));

        // The superseded connection's detach must not flip the device offline.
        assert!(!registry.detach(&DeviceId::new("w1"), 1));
        let online = registry.snapshot(&DeviceFilter {
            status: Some(DeviceStatus::Online),
            ..Default::default()
        });
        assert_eq!(online.len(), 1);
    }

    #[test]
    fn test_touch_unknown_device() {
        let registry = registry();
        assert!(!registry.touch(&DeviceId::new("ghost"), &HeartbeatPayload::default()));
    }

    #[test]
    fn test_touch_clamps_metrics() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(1);
        registry.register(profile("w1", 4), None, handle);
        let heartbeat = HeartbeatPayload {
            cpu_percent: f64::NAN,
            memory_percent: 250.0,
            active_tasks: 0,
            uptime_seconds: 10,
        };
        registry.touch(&DeviceId::new("w1"), &heartbeat);
        let view = &registry.snapshot(&DeviceFilter::default())[0];
        assert_eq!(view.cpu_percent, 0.0);
        assert_eq!(view.memory_percent, 100.0);
    }

    #[test]
    fn test_sweep_stale_takes_online_only() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(1);
        registry.register(profile("w1", 4), None, handle);
        // Zero threshold: everything online is stale.
        let swept = registry.sweep_stale(Duration::from_secs(0));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, DeviceId::new("w1"));
        assert!(registry.sweep_stale(Duration::from_secs(0)).is_empty());
    }

    #[test]
    fn test_find_candidates_respects_concurrency_cap() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(1);
        registry.register(profile("w1", 4), None, handle);
        let reqs = TaskRequirements::default();
        assert_eq!(registry.find_candidates("echo", &reqs).len(), 1);

        // max_concurrent_tasks is 2
        registry.begin_dispatch(&DeviceId::new("w1")).unwrap();
        registry.begin_dispatch(&DeviceId::new("w1")).unwrap();
        assert!(registry.find_candidates("echo", &reqs).is_empty());

        registry.finish_task(&DeviceId::new("w1"));
        assert_eq!(registry.find_candidates("echo", &reqs).len(), 1);
    }

    #[test]
    fn test_find_candidates_filters_task_type_and_requirements() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(1);
        registry.register(profile("w1", 2), None, handle);

        assert!(registry
            .find_candidates("transcode", &TaskRequirements::default())
            .is_empty());

        let reqs = TaskRequirements {
            min_cpu_cores: 4,
            ..Default::default()
        };
        assert!(registry.find_candidates("echo", &reqs).is_empty());
    }

    #[test]
    fn test_remove_returns_handle() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(7);
        registry.register(profile("w1", 4), None, handle);
        let removed = registry.remove(&DeviceId::new("w1")).unwrap();
        assert_eq!(removed.map(|h| h.conn_id()), Some(7));
        assert!(registry.remove(&DeviceId::new("w1")).is_none());
        assert!(registry.snapshot(&DeviceFilter::default()).is_empty());
    }

    #[test]
    fn test_export_restore_roundtrip_offline() {
        let registry = registry();
        let (handle, _rx) = loopback_handle(1);
        registry.register(profile("w1", 4), None, handle);
        let exported = registry.export();
        assert_eq!(exported.len(), 1);

        let restored = DeviceRegistry::new(Arc::new(ClusterGauges::new()));
        restored.restore(exported);
        let views = restored.snapshot(&DeviceFilter::default());
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, DeviceStatus::Offline);
        assert_eq!(views[0].active_task_count, 0);
        assert!(restored
            .find_candidates("echo", &TaskRequirements::default())
            .is_empty());
    }
}
