//! Operator entry points
//!
//! Every family exposes a symmetric pair: `run_<op>` submits immediately,
//! `record_<op>` appends to a caller-owned recorder. Both funnel into one
//! internal implementation per family so binding and resource logic exist
//! once. Output tensors come from the runtime's buffer pool; an operator
//! with in-place semantics documents that and returns a tensor aliasing
//! the input buffer.

pub mod activation;
pub mod attention;
pub mod conv;
pub mod ffn;
pub mod gather;
pub mod matmul;
pub mod norm;
pub mod sample;

use std::sync::Arc;

use crate::config::{UniformField, UniformFieldType};
use crate::cache::UniformWriter;
use crate::error::KernelResult;
use crate::runtime::KernelRuntime;
use crate::telemetry;
use crate::tensor::{BufferUse, Dtype, Tensor};

/// Value for one named uniform field
#[derive(Debug, Clone, Copy)]
pub(crate) enum UniformValue {
    U32(u32),
    I32(i32),
    F32(f32),
}

/// Write `values` into the offsets the variant's uniforms layout declares.
/// Fields with no supplied value stay zeroed.
pub(crate) fn write_uniform_fields(
    writer: &mut UniformWriter<'_>,
    fields: &[UniformField],
    values: &[(&str, UniformValue)],
) {
    for field in fields {
        let Some((_, value)) = values.iter().find(|(name, _)| *name == field.name) else {
            continue;
        };
        match (field.ty, value) {
            (UniformFieldType::U32, UniformValue::U32(v)) => writer.write_u32(field.offset, *v),
            (UniformFieldType::I32, UniformValue::I32(v)) => writer.write_i32(field.offset, *v),
            (UniformFieldType::F32, UniformValue::F32(v)) => writer.write_f32(field.offset, *v),
            // Mixed declarations still land little-endian in 4 bytes.
            (UniformFieldType::U32, UniformValue::I32(v)) => {
                writer.write_u32(field.offset, *v as u32)
            }
            (UniformFieldType::I32, UniformValue::U32(v)) => {
                writer.write_i32(field.offset, *v as i32)
            }
            (UniformFieldType::F32, UniformValue::U32(v)) => {
                writer.write_f32(field.offset, *v as f32)
            }
            (UniformFieldType::F32, UniformValue::I32(v)) => {
                writer.write_f32(field.offset, *v as f32)
            }
            (UniformFieldType::U32, UniformValue::F32(v)) => {
                writer.write_u32(field.offset, *v as u32)
            }
            (UniformFieldType::I32, UniformValue::F32(v)) => {
                writer.write_i32(field.offset, *v as i32)
            }
        }
    }
}

/// Acquire an output tensor from the pool
pub(crate) fn alloc_output(
    rt: &KernelRuntime,
    dtype: Dtype,
    shape: Vec<u32>,
    label: &str,
) -> Tensor {
    let elems: u64 = shape.iter().map(|&d| d as u64).product();
    let bytes = elems * u64::from(dtype.size_bytes().unwrap_or(4));
    let buffer = rt
        .buffer_pool()
        .acquire(bytes.max(4), BufferUse::Storage, label);
    Tensor::new(buffer, dtype, shape, label)
}

/// Acquire a scratch storage buffer released by the caller
pub(crate) fn alloc_scratch(rt: &KernelRuntime, bytes: u64, label: &str) -> Arc<wgpu::Buffer> {
    rt.buffer_pool().acquire(bytes.max(4), BufferUse::Storage, label)
}

/// Non-strict downgrade: if selection failed softly and the runtime is
/// not strict, warn once and retry on the default path. Every other
/// error stays fatal.
pub(crate) fn soft_fallback<T>(
    rt: &KernelRuntime,
    primary: KernelResult<T>,
    retry: impl FnOnce() -> KernelResult<T>,
) -> KernelResult<T> {
    match primary {
        Err(e) if !rt.strict() && e.is_soft_in_non_strict() => {
            telemetry::warn_once(e.warn_topic(), &e.to_string());
            retry()
        }
        other => other,
    }
}

pub use activation::{
    record_bias_add, record_cast, record_clamp, record_gelu, record_residual, record_rope,
    record_scale, record_silu, record_softmax, run_bias_add, run_cast, run_clamp, run_gelu,
    run_residual, run_rope, run_scale, run_silu, run_softmax,
};
pub use attention::{record_attention, run_attention, AttentionOptions};
pub use conv::{
    record_conv2d, record_upsample2d, run_conv2d, run_upsample2d, Conv2dOptions,
    Upsample2dOptions,
};
pub use ffn::{record_fused_ffn, run_fused_ffn, FfnOptions};
pub use gather::{
    record_gather, record_moe_gather, record_scatter_add, run_gather, run_moe_gather,
    run_scatter_add, GatherOptions,
};
pub use matmul::{record_matmul, run_matmul, MatmulOptions};
pub use norm::{
    record_fused_matmul_rmsnorm, record_groupnorm, record_layernorm, record_rmsnorm,
    run_fused_matmul_rmsnorm, run_groupnorm, run_layernorm, run_rmsnorm, GroupNormOptions,
    NormOptions,
};
pub use sample::{
    run_check_stop, run_sample, run_topk, record_topk, SampleOptions, SampleOutcome, TopkOutput,
};
