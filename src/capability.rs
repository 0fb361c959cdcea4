//! Device capability snapshot and epoch tracking
//!
//! The snapshot is taken once at device acquisition and never mutated;
//! device-lost recovery installs a fresh snapshot and bumps the epoch.
//! Every cache consults the epoch at read time and discards entries keyed
//! to an older epoch before serving the current call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Immutable device descriptor: features and numeric limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub has_f16: bool,
    pub has_subgroups: bool,
    pub max_workgroup_storage: u32,
    pub max_workgroups_per_dim: u32,
    pub max_storage_binding: u64,
    pub subgroup_size_hint: Option<u32>,
}

impl CapabilitySnapshot {
    /// Build a snapshot from an acquired device's features and limits
    pub fn from_device(device: &wgpu::Device) -> Self {
        let features = device.features();
        let limits = device.limits();
        Self {
            has_f16: features.contains(wgpu::Features::SHADER_F16),
            has_subgroups: features.contains(wgpu::Features::SUBGROUP),
            max_workgroup_storage: limits.max_compute_workgroup_storage_size,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
            max_storage_binding: limits.max_storage_buffer_binding_size as u64,
            subgroup_size_hint: (limits.min_subgroup_size > 0)
                .then_some(limits.min_subgroup_size),
        }
    }

    /// Shared-memory budget available to a single workgroup, in bytes
    pub fn shared_mem_budget(&self) -> u32 {
        self.max_workgroup_storage
    }
}

impl Default for CapabilitySnapshot {
    fn default() -> Self {
        // Baseline WebGPU limits: no optional features
        Self {
            has_f16: false,
            has_subgroups: false,
            max_workgroup_storage: 16_384,
            max_workgroups_per_dim: 65_535,
            max_storage_binding: 128 << 20,
            subgroup_size_hint: None,
        }
    }
}

/// Capability snapshot plus the monotonically increasing device epoch
pub struct DeviceCaps {
    snapshot: RwLock<CapabilitySnapshot>,
    epoch: AtomicU64,
}

impl DeviceCaps {
    pub fn new(snapshot: CapabilitySnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(snapshot),
            epoch: AtomicU64::new(1),
        })
    }

    pub fn get(&self) -> CapabilitySnapshot {
        *self.snapshot.read()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Install a fresh snapshot and bump the epoch. Used for device-lost
    /// recovery; all caches keyed to the prior epoch become invalid.
    pub fn reset(&self, snapshot: CapabilitySnapshot) -> u64 {
        *self.snapshot.write() = snapshot;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("[Caps] Device epoch bumped to {}", epoch);
        epoch
    }
}

/// Request a device with the optional inference features that are present
/// on the adapter (f16 arithmetic, subgroup operations).
pub async fn acquire_device(
    adapter: &wgpu::Adapter,
) -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>, Arc<DeviceCaps>), wgpu::RequestDeviceError> {
    let available = adapter.features();
    let mut wanted = wgpu::Features::empty();
    for feature in [wgpu::Features::SHADER_F16, wgpu::Features::SUBGROUP] {
        if available.contains(feature) {
            wanted |= feature;
        }
    }

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kiln device"),
                required_features: wanted,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        )
        .await?;

    let snapshot = CapabilitySnapshot::from_device(&device);
    log::info!(
        "[Caps] Acquired device: f16={} subgroups={} wg_storage={} max_wg_dim={}",
        snapshot.has_f16,
        snapshot.has_subgroups,
        snapshot.max_workgroup_storage,
        snapshot.max_workgroups_per_dim,
    );

    Ok((
        Arc::new(device),
        Arc::new(queue),
        DeviceCaps::new(snapshot),
    ))
}

/// Blocking wrapper over `acquire_device` for synchronous startup paths
pub fn acquire_device_blocking(
    adapter: &wgpu::Adapter,
) -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>, Arc<DeviceCaps>), wgpu::RequestDeviceError> {
    pollster::block_on(acquire_device(adapter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_bumps_epoch_and_swaps_snapshot() {
        let caps = DeviceCaps::new(CapabilitySnapshot::default());
        assert_eq!(caps.epoch(), 1);
        assert!(!caps.get().has_f16);

        let new_epoch = caps.reset(CapabilitySnapshot {
            has_f16: true,
            ..CapabilitySnapshot::default()
        });
        assert_eq!(new_epoch, 2);
        assert_eq!(caps.epoch(), 2);
        assert!(caps.get().has_f16);
    }
}
