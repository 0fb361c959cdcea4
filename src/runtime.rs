//! The kernel runtime aggregate
//!
//! Owns the registry, thresholds, rule tables, caches, and pools, and
//! hands selectors and operators everything they consult. One runtime per
//! device; single-threaded cooperative host execution per the
//! concurrency model.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::{PipelineCache, ShaderCache, ShaderLibrary, UniformScratchPool};
use crate::capability::{CapabilitySnapshot, DeviceCaps};
use crate::config::{Catalog, KernelRegistry, TuningThresholds};
use crate::error::KernelResult;
use crate::exec::CommandRecorder;
use crate::rules::RuleRegistry;
use crate::select::SelectorEnv;
use crate::telemetry;
use crate::tensor::{BufferPool, DeviceBufferPool};

/// Inference phase, used to key path overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Decode,
    Prefill,
}

/// Matmul call sites that may carry a path override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatmulRole {
    QkvProj,
    OutProj,
    FfnProj,
    Logits,
    Generic,
}

/// Per-layer operator-path overrides, read-only after init
#[derive(Debug, Default, Clone)]
pub struct PathOverrides {
    attention: FxHashMap<(u32, Phase), String>,
    matmul: FxHashMap<(u32, MatmulRole), String>,
}

impl PathOverrides {
    pub fn set_attention(&mut self, layer_idx: u32, phase: Phase, variant: impl Into<String>) {
        self.attention.insert((layer_idx, phase), variant.into());
    }

    pub fn set_matmul(&mut self, layer_idx: u32, role: MatmulRole, variant: impl Into<String>) {
        self.matmul.insert((layer_idx, role), variant.into());
    }

    pub fn attention(&self, layer_idx: u32, phase: Phase) -> Option<&str> {
        self.attention.get(&(layer_idx, phase)).map(|s| s.as_str())
    }

    pub fn matmul(&self, layer_idx: u32, role: MatmulRole) -> Option<&str> {
        self.matmul.get(&(layer_idx, role)).map(|s| s.as_str())
    }
}

/// Construction-time options
pub struct RuntimeOptions {
    /// Strict mode aborts on every error; non-strict downgrades override
    /// and feature-fallback errors to one-shot warnings. Strict is the
    /// production default; non-strict exists only for migration.
    pub strict: bool,
    pub overrides: PathOverrides,
    pub buffer_pool: Option<Arc<dyn BufferPool>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            strict: true,
            overrides: PathOverrides::default(),
            buffer_pool: None,
        }
    }
}

pub struct KernelRuntime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    caps: Arc<DeviceCaps>,
    registry: Arc<KernelRegistry>,
    thresholds: TuningThresholds,
    rules: RuleRegistry,
    shader_library: Arc<ShaderLibrary>,
    pipelines: PipelineCache,
    uniforms: Arc<UniformScratchPool>,
    buffer_pool: Arc<dyn BufferPool>,
    overrides: PathOverrides,
    strict: bool,
}

impl KernelRuntime {
    /// Build a runtime over the embedded kernel catalog
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        caps: Arc<DeviceCaps>,
    ) -> KernelResult<Self> {
        let catalog = crate::config::builtin_catalog()?;
        Self::with_catalog(device, queue, caps, catalog, RuntimeOptions::default())
    }

    /// Build a runtime from an explicit catalog and options
    pub fn with_catalog(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        caps: Arc<DeviceCaps>,
        catalog: Catalog,
        options: RuntimeOptions,
    ) -> KernelResult<Self> {
        telemetry::init_logging_state();

        let registry = Arc::new(KernelRegistry::from_catalog(&catalog)?);
        let rules = catalog.build_rules();
        let thresholds = catalog.thresholds.clone();

        let shader_library = Arc::new(ShaderLibrary::new());
        let shaders = ShaderCache::new(shader_library.clone());
        let pipelines = PipelineCache::new(
            device.clone(),
            caps.clone(),
            registry.clone(),
            shaders,
        );
        let uniforms = Arc::new(UniformScratchPool::new(device.clone(), queue.clone()));
        let buffer_pool = options
            .buffer_pool
            .unwrap_or_else(|| Arc::new(DeviceBufferPool::new(device.clone())));

        log::info!(
            "[Runtime] Ready: {} operations, strict={}",
            registry.operation_names().len(),
            options.strict
        );

        Ok(Self {
            device,
            queue,
            caps,
            registry,
            thresholds,
            rules,
            shader_library,
            pipelines,
            uniforms,
            buffer_pool,
            overrides: options.overrides,
            strict: options.strict,
        })
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn thresholds(&self) -> &TuningThresholds {
        &self.thresholds
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    pub fn uniform_pool(&self) -> &UniformScratchPool {
        &self.uniforms
    }

    pub fn buffer_pool(&self) -> &Arc<dyn BufferPool> {
        &self.buffer_pool
    }

    pub fn shader_library(&self) -> &ShaderLibrary {
        &self.shader_library
    }

    pub fn overrides(&self) -> &PathOverrides {
        &self.overrides
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Borrowed view the selectors consume
    pub fn selector_env(&self) -> SelectorEnv<'_> {
        SelectorEnv {
            registry: &self.registry,
            rules: &self.rules,
            thresholds: &self.thresholds,
            caps: self.caps.get(),
        }
    }

    /// A batched recorder bound to this runtime's pools
    pub fn create_recorder(&self, label: &str) -> CommandRecorder {
        CommandRecorder::new(
            self.device.clone(),
            self.queue.clone(),
            self.uniforms.clone(),
            self.buffer_pool.clone(),
            label,
        )
    }

    /// Drop every cached pipeline, layout, module, and pooled scratch.
    /// Subsequent calls re-fill lazily with identical results.
    pub fn clear_caches(&self) {
        self.pipelines.clear();
        self.uniforms.clear();
        log::info!("[Runtime] Caches cleared");
    }

    /// Device-lost recovery: bump the epoch, install the new snapshot,
    /// and invalidate everything. The next call proceeds against the new
    /// epoch.
    pub fn handle_device_lost(&self, snapshot: CapabilitySnapshot) {
        let epoch = self.caps.reset(snapshot);
        self.clear_caches();
        log::warn!("[Runtime] Device lost handled, now at epoch {}", epoch);
    }
}
