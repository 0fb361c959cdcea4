//! kiln - GPU kernel selection and dispatch runtime for transformer
//! inference
//!
//! The runtime decides, for each operator invocation, which shader
//! variant to run, how many workgroups to launch, which buffers to bind,
//! and how to reuse caches safely across device epochs. Operator math
//! lives in compiled WGSL modules registered with the shader library;
//! this crate owns everything around them: the declarative kernel
//! catalog, the rule-matched variant selection, the validated kernel
//! plans, the deduplicated pipeline and layout caches, scratch uniform
//! pooling, and the dispatch/record duality that lets every operator run
//! immediately or into a batched recorder.

// Core runtime modules
pub mod capability;
pub mod constants;
pub mod error;
pub mod telemetry;
pub mod tensor;

// Catalog and selection
pub mod config;
pub mod plan;
pub mod rules;
pub mod select;
pub mod validate;

// Resources and execution
pub mod cache;
pub mod exec;
pub mod ops;
pub mod runtime;

pub use capability::{acquire_device, acquire_device_blocking, CapabilitySnapshot, DeviceCaps};
pub use config::{Catalog, KernelRegistry, KernelVariantConfig, TuningThresholds};
pub use error::{KernelError, KernelResult};
pub use plan::{AttentionTier, KernelPlan, Workgroups};
pub use runtime::{KernelRuntime, MatmulRole, PathOverrides, Phase, RuntimeOptions};
pub use tensor::{BufferPool, BufferUse, DeviceBufferPool, Dtype, Tensor, WeightBuffer};

// Re-export wgpu so embedders build against the same version
pub use wgpu;
