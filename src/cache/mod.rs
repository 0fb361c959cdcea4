//! Device-epoch-scoped resource caches
//!
//! Shader modules, pipelines, layouts, and scratch uniforms. All caches
//! key on the current device epoch; an epoch bump invalidates everything
//! transactionally before the next call is served.

pub mod pipeline;
pub mod shader;
pub mod uniform;

pub use pipeline::{
    check_creation_invariants, merge_specialization, LayoutId, PipelineCache,
};
pub use shader::{ShaderCache, ShaderLibrary};
pub use uniform::{ScratchUniform, UniformScratchPool, UniformWriter};
