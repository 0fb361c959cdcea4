//! Pipeline, bind-group-layout, and pipeline-layout caches
//!
//! Pipelines are deduplicated on `(device_epoch, operation, variant,
//! canonicalized specialization, explicit layout)`. Specialization maps
//! merge the variant's catalog overrides with caller-provided overrides
//! (caller wins) and canonicalize by sorted key with `f64::to_bits` so the
//! cache key is deterministic. Creation enforces the power-of-two
//! workgroup invariant and the required-feature check before touching the
//! device; driver-side failures are captured by a validation error scope.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::cache::shader::ShaderCache;
use crate::capability::{CapabilitySnapshot, DeviceCaps};
use crate::config::{BindingKind, BindingSlot, KernelFeature, KernelRegistry, KernelVariantConfig};
use crate::error::{KernelError, KernelResult};

/// Stable identity of a cached bind-group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    epoch: u64,
    operation: String,
    variant: String,
    spec: Vec<(String, u64)>,
    explicit_layout: Option<LayoutId>,
}

/// Merge catalog overrides with caller overrides (caller wins) into the
/// f64 constants map handed to pipeline creation.
pub fn merge_specialization(
    config: &KernelVariantConfig,
    variant: &str,
    caller: Option<&BTreeMap<String, f64>>,
) -> KernelResult<BTreeMap<String, f64>> {
    let mut merged = BTreeMap::new();
    for (name, value) in &config.overrides {
        let value = value.as_f64().ok_or_else(|| KernelError::Config {
            message: format!(
                "variant '{}' override '{}' is not a numeric scalar",
                variant, name
            ),
        })?;
        merged.insert(name.clone(), value);
    }
    if let Some(caller) = caller {
        for (name, value) in caller {
            merged.insert(name.clone(), *value);
        }
    }
    Ok(merged)
}

/// Canonical cache-key form of a specialization map: sorted entries with
/// bit-exact values.
fn canonicalize(spec: &BTreeMap<String, f64>) -> Vec<(String, u64)> {
    spec.iter()
        .map(|(k, v)| (k.clone(), v.to_bits()))
        .collect()
}

fn feature_supported(feature: KernelFeature, caps: &CapabilitySnapshot) -> bool {
    match feature {
        KernelFeature::F16 => caps.has_f16,
        KernelFeature::Subgroups => caps.has_subgroups,
        KernelFeature::SubgroupsF16 => caps.has_f16 && caps.has_subgroups,
    }
}

/// Pre-creation invariants: power-of-two workgroup axes (including every
/// `*WORKGROUP_SIZE*` override) and required features present on the
/// device. Violations fail pipeline creation before the driver is asked.
pub fn check_creation_invariants(
    config: &KernelVariantConfig,
    variant: &str,
    caps: &CapabilitySnapshot,
    spec: &BTreeMap<String, f64>,
) -> KernelResult<()> {
    for (axis, &size) in ["x", "y", "z"].iter().zip(config.workgroup.iter()) {
        if size == 0 || !size.is_power_of_two() {
            return Err(KernelError::Config {
                message: format!(
                    "variant '{}' workgroup {} axis {} is not a positive power of two",
                    variant, axis, size
                ),
            });
        }
    }

    for (name, &value) in spec {
        if name.contains("WORKGROUP_SIZE") {
            let ok = value > 0.0
                && value.fract() == 0.0
                && (value as u64).is_power_of_two();
            if !ok {
                return Err(KernelError::Config {
                    message: format!(
                        "variant '{}' override '{}' = {} is not a positive power of two",
                        variant, name, value
                    ),
                });
            }
        }
    }

    for &feature in &config.requires {
        if !feature_supported(feature, caps) {
            return Err(KernelError::MissingFeature {
                variant: variant.to_string(),
                feature: feature.to_string(),
            });
        }
    }

    Ok(())
}

fn layout_entry(slot: &BindingSlot) -> wgpu::BindGroupLayoutEntry {
    let ty = match slot.kind {
        BindingKind::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::ReadStorage => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::ReadWriteStorage => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: slot.index,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

/// Device-epoch-scoped caches for pipelines and layouts
pub struct PipelineCache {
    device: Arc<wgpu::Device>,
    caps: Arc<DeviceCaps>,
    registry: Arc<KernelRegistry>,
    shaders: ShaderCache,

    pipelines: RwLock<FxHashMap<PipelineKey, Arc<wgpu::ComputePipeline>>>,
    bind_group_layouts: RwLock<FxHashMap<Vec<BindingSlot>, (LayoutId, Arc<wgpu::BindGroupLayout>)>>,
    layouts_by_id: RwLock<FxHashMap<LayoutId, Arc<wgpu::BindGroupLayout>>>,
    pipeline_layouts: RwLock<FxHashMap<Vec<LayoutId>, Arc<wgpu::PipelineLayout>>>,

    next_layout_id: AtomicU64,
    epoch_seen: AtomicU64,
}

impl PipelineCache {
    pub fn new(
        device: Arc<wgpu::Device>,
        caps: Arc<DeviceCaps>,
        registry: Arc<KernelRegistry>,
        shaders: ShaderCache,
    ) -> Self {
        let epoch = caps.epoch();
        Self {
            device,
            caps,
            registry,
            shaders,
            pipelines: RwLock::new(FxHashMap::default()),
            bind_group_layouts: RwLock::new(FxHashMap::default()),
            layouts_by_id: RwLock::new(FxHashMap::default()),
            pipeline_layouts: RwLock::new(FxHashMap::default()),
            next_layout_id: AtomicU64::new(1),
            epoch_seen: AtomicU64::new(epoch),
        }
    }

    pub fn shaders(&self) -> &ShaderCache {
        &self.shaders
    }

    /// Epoch check at call entry: on mismatch every cache map is swapped
    /// for a fresh one before the current call proceeds.
    pub fn check_epoch(&self) -> u64 {
        let current = self.caps.epoch();
        let seen = self.epoch_seen.load(Ordering::Acquire);
        if seen != current {
            let mut pipelines = self.pipelines.write();
            let mut bgls = self.bind_group_layouts.write();
            let mut by_id = self.layouts_by_id.write();
            let mut pls = self.pipeline_layouts.write();
            // Re-check under the locks so one caller does the swap.
            if self.epoch_seen.load(Ordering::Acquire) != current {
                log::warn!(
                    "[PipelineCache] Epoch changed {} -> {}, dropping cached pipelines",
                    seen,
                    current
                );
                pipelines.clear();
                bgls.clear();
                by_id.clear();
                pls.clear();
                self.shaders.clear();
                self.epoch_seen.store(current, Ordering::Release);
            }
        }
        current
    }

    /// Clear everything (device loss). The next call re-fills lazily.
    pub fn clear(&self) {
        self.pipelines.write().clear();
        self.bind_group_layouts.write().clear();
        self.layouts_by_id.write().clear();
        self.pipeline_layouts.write().clear();
        self.shaders.clear();
    }

    pub fn get_or_create_bind_group_layout(
        &self,
        label: &str,
        entries: &[BindingSlot],
    ) -> (LayoutId, Arc<wgpu::BindGroupLayout>) {
        let key: Vec<BindingSlot> = entries.to_vec();
        if let Some((id, layout)) = self.bind_group_layouts.read().get(&key) {
            return (*id, layout.clone());
        }

        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> =
            entries.iter().map(layout_entry).collect();
        let layout = Arc::new(self.device.create_bind_group_layout(
            &wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &wgpu_entries,
            },
        ));

        let mut bgls = self.bind_group_layouts.write();
        if let Some((id, existing)) = bgls.get(&key) {
            return (*id, existing.clone());
        }
        let id = LayoutId(self.next_layout_id.fetch_add(1, Ordering::Relaxed));
        bgls.insert(key, (id, layout.clone()));
        self.layouts_by_id.write().insert(id, layout.clone());
        (id, layout)
    }

    pub fn layout_by_id(&self, id: LayoutId) -> Option<Arc<wgpu::BindGroupLayout>> {
        self.layouts_by_id.read().get(&id).cloned()
    }

    pub fn get_or_create_pipeline_layout(
        &self,
        label: &str,
        layout_ids: &[LayoutId],
    ) -> KernelResult<Arc<wgpu::PipelineLayout>> {
        let key: Vec<LayoutId> = layout_ids.to_vec();
        if let Some(layout) = self.pipeline_layouts.read().get(&key) {
            return Ok(layout.clone());
        }

        let mut bgls = Vec::with_capacity(layout_ids.len());
        for &id in layout_ids {
            bgls.push(self.layout_by_id(id).ok_or_else(|| KernelError::Config {
                message: format!("pipeline layout '{}' references unknown layout id", label),
            })?);
        }
        let refs: Vec<&wgpu::BindGroupLayout> = bgls.iter().map(|l| l.as_ref()).collect();
        let layout = Arc::new(self.device.create_pipeline_layout(
            &wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &refs,
                push_constant_ranges: &[],
            },
        ));

        let mut pls = self.pipeline_layouts.write();
        let entry = pls.entry(key).or_insert_with(|| layout.clone());
        Ok(entry.clone())
    }

    /// Synchronous hot-path lookup; never compiles.
    pub fn get_cached_pipeline(
        &self,
        operation: &str,
        variant: &str,
        caller_spec: Option<&BTreeMap<String, f64>>,
    ) -> Option<Arc<wgpu::ComputePipeline>> {
        let epoch = self.check_epoch();
        let config = self.registry.lookup(operation, variant).ok()?;
        let merged = merge_specialization(config, variant, caller_spec).ok()?;
        let key = PipelineKey {
            epoch,
            operation: operation.to_string(),
            variant: variant.to_string(),
            spec: canonicalize(&merged),
            explicit_layout: None,
        };
        self.pipelines.read().get(&key).cloned()
    }

    /// Resolve a pipeline, compiling shader and pipeline on miss.
    ///
    /// Idempotent within an epoch: equal `(operation, variant, spec,
    /// layout)` always resolves to the same pipeline identity.
    pub async fn get_or_create_pipeline(
        &self,
        operation: &str,
        variant: &str,
        explicit_layout: Option<LayoutId>,
        caller_spec: Option<&BTreeMap<String, f64>>,
    ) -> KernelResult<Arc<wgpu::ComputePipeline>> {
        let epoch = self.check_epoch();
        let config = self.registry.lookup(operation, variant)?;
        let merged = merge_specialization(config, variant, caller_spec)?;

        let key = PipelineKey {
            epoch,
            operation: operation.to_string(),
            variant: variant.to_string(),
            spec: canonicalize(&merged),
            explicit_layout,
        };
        if let Some(pipeline) = self.pipelines.read().get(&key) {
            return Ok(pipeline.clone());
        }

        check_creation_invariants(config, variant, &self.caps.get(), &merged)?;

        let label = format!("{}/{}", operation, variant);
        let module = self
            .shaders
            .get_or_compile(&self.device, epoch, &config.shader_source, &label)
            .await?;

        let pipeline_layout = match explicit_layout {
            Some(id) => {
                let layout = self.get_or_create_pipeline_layout(&label, &[id])?;
                Some(layout)
            }
            None => None,
        };

        let constants: HashMap<String, f64> =
            merged.iter().map(|(k, v)| (k.clone(), *v)).collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: pipeline_layout.as_deref(),
                module: &module,
                entry_point: &config.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            });
        if let Some(error) = self.device.pop_error_scope().await {
            return Err(KernelError::Compilation {
                label,
                message: error.to_string(),
            });
        }

        let pipeline = Arc::new(pipeline);
        // Duplicate in-flight fills coalesce to one cached identity.
        let mut pipelines = self.pipelines.write();
        let entry = pipelines.entry(key).or_insert_with(|| pipeline.clone());
        Ok(entry.clone())
    }

    #[cfg(test)]
    pub fn cached_pipeline_count(&self) -> usize {
        self.pipelines.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, MetaScalar};

    fn test_config(workgroup: [u32; 3]) -> KernelVariantConfig {
        let catalog = config::builtin_catalog().unwrap();
        let mut config = catalog.operations["attention"].variants["decode_streaming"].clone();
        config.workgroup = workgroup;
        config
    }

    #[test]
    fn merged_spec_caller_wins() {
        let catalog = config::builtin_catalog().unwrap();
        let config = &catalog.operations["attention"].variants["decode_subgroup"];

        let mut caller = BTreeMap::new();
        caller.insert("SUBGROUP_WORKGROUP_SIZE".to_string(), 128.0);
        let merged = merge_specialization(config, "decode_subgroup", Some(&caller)).unwrap();
        assert_eq!(merged["SUBGROUP_WORKGROUP_SIZE"], 128.0);

        let merged = merge_specialization(config, "decode_subgroup", None).unwrap();
        assert_eq!(merged["SUBGROUP_WORKGROUP_SIZE"], 64.0);
    }

    #[test]
    fn canonicalization_is_key_sorted_and_bit_exact() {
        let mut spec = BTreeMap::new();
        spec.insert("B".to_string(), 2.0);
        spec.insert("A".to_string(), 1.5);
        let canon = canonicalize(&spec);
        assert_eq!(canon[0].0, "A");
        assert_eq!(canon[0].1, 1.5f64.to_bits());
        assert_eq!(canon[1].0, "B");
    }

    #[test]
    fn non_power_of_two_workgroup_fails_creation() {
        let config = test_config([48, 1, 1]);
        let caps = CapabilitySnapshot::default();
        let err = check_creation_invariants(&config, "decode_streaming", &caps, &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn non_power_of_two_workgroup_override_fails_creation() {
        let config = test_config([64, 1, 1]);
        let caps = CapabilitySnapshot::default();
        let mut spec = BTreeMap::new();
        spec.insert("GEMV_WORKGROUP_SIZE".to_string(), 48.0);
        assert!(
            check_creation_invariants(&config, "decode_streaming", &caps, &spec).is_err()
        );
        spec.insert("GEMV_WORKGROUP_SIZE".to_string(), 64.0);
        assert!(
            check_creation_invariants(&config, "decode_streaming", &caps, &spec).is_ok()
        );
    }

    #[test]
    fn missing_feature_fails_creation() {
        let catalog = config::builtin_catalog().unwrap();
        let config = &catalog.operations["attention"].variants["decode_subgroup"];
        let caps = CapabilitySnapshot::default(); // no subgroups
        let merged = merge_specialization(config, "decode_subgroup", None).unwrap();
        let err =
            check_creation_invariants(config, "decode_subgroup", &caps, &merged).unwrap_err();
        assert!(matches!(err, KernelError::MissingFeature { .. }));
    }

    #[test]
    fn every_builtin_workgroup_axis_is_power_of_two() {
        let catalog = config::builtin_catalog().unwrap();
        let caps = CapabilitySnapshot {
            has_f16: true,
            has_subgroups: true,
            ..CapabilitySnapshot::default()
        };
        for (op, entry) in &catalog.operations {
            for (name, config) in &entry.variants {
                let merged = merge_specialization(config, name, None).unwrap();
                check_creation_invariants(config, name, &caps, &merged)
                    .unwrap_or_else(|e| panic!("{}/{}: {}", op, name, e));
            }
        }
    }

    #[test]
    fn builtin_overrides_are_numeric() {
        let catalog = config::builtin_catalog().unwrap();
        for entry in catalog.operations.values() {
            for config in entry.variants.values() {
                for value in config.overrides.values() {
                    assert!(value.as_f64().is_some());
                    assert!(!matches!(value, MetaScalar::Text(_)));
                }
            }
        }
    }
}
