//! Attention operator (standard, tiered, tiered-quant, paged)
//!
//! Q is `[seq_len, num_heads, head_dim]`; K and V are
//! `[kv_len, num_heads, head_dim]` (or paged pools addressed through the
//! page table). Output is `[seq_len, num_heads, head_dim]` in the plan's
//! output dtype.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, soft_fallback, write_uniform_fields, UniformValue};
use crate::plan::AttentionTier;
use crate::runtime::{KernelRuntime, Phase};
use crate::select::{select_attention, AttentionParams};
use crate::tensor::Tensor;

/// Per-call attention options
#[derive(Debug, Clone, Default)]
pub struct AttentionOptions {
    pub layer_idx: u32,
    /// Softmax scale; defaults to `1 / sqrt(head_dim)`
    pub scale: Option<f32>,
    /// Paged KV cache: the page table tensor and entries per page
    pub page_table: Option<Tensor>,
    pub page_size: u32,
}

fn dims_from(
    q: &Tensor,
    k: &Tensor,
) -> KernelResult<(u32, u32, u32, u32)> {
    let (&[seq_len, num_heads, head_dim], &[kv_len, ..]) =
        (q.shape.as_slice(), k.shape.as_slice())
    else {
        return Err(KernelError::Shape {
            operation: "attention".to_string(),
            detail: format!(
                "expected Q [seq, heads, head_dim] and K [kv, ...], got {:?} and {:?}",
                q.shape, k.shape
            ),
        });
    };
    Ok((seq_len, kv_len, num_heads, head_dim))
}

fn workgroups_desc(tier: Option<AttentionTier>) -> &'static str {
    match tier {
        Some(AttentionTier::Subgroup) => "num_heads",
        Some(AttentionTier::TiledLarge) => "ceil(seq_len / large_block) * num_heads",
        Some(AttentionTier::TiledSmall) => "ceil(seq_len / small_block) * num_heads",
        _ => "seq_len * num_heads",
    }
}

async fn attention_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    options: &AttentionOptions,
) -> KernelResult<Tensor> {
    q.check_shape("attention")?;
    k.check_shape("attention")?;
    v.check_shape("attention")?;
    let (seq_len, kv_len, num_heads, head_dim) = dims_from(q, k)?;

    let phase = if seq_len == 1 { Phase::Decode } else { Phase::Prefill };
    let is_paged = options.page_table.is_some();
    let params = AttentionParams {
        seq_len,
        kv_len,
        head_dim,
        num_heads,
        q_dtype: q.dtype,
        kv_dtype: k.dtype,
        layer_idx: options.layer_idx,
        is_paged,
        variant_override: rt
            .overrides()
            .attention(options.layer_idx, phase)
            .map(|s| s.to_string()),
    };

    let env = rt.selector_env();
    let (plan, _ctx) = soft_fallback(rt, select_attention(&env, &params), || {
        let defaulted = AttentionParams {
            variant_override: None,
            ..params.clone()
        };
        select_attention(&env, &defaulted)
    })?;

    let out = alloc_output(
        rt,
        plan.output_dtype,
        vec![seq_len, num_heads, head_dim],
        "attention out",
    );

    let scale = options
        .scale
        .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());
    let config = rt.registry().lookup("attention", &plan.variant)?;
    let uniforms = config.uniforms.clone();
    let chunk_dim = head_dim / 2;
    let page_size = options.page_size;

    let mut bindings: Vec<(u32, &wgpu::Buffer)> = vec![
        (1, q.buffer.as_ref()),
        (2, k.buffer.as_ref()),
        (3, v.buffer.as_ref()),
        (4, out.buffer.as_ref()),
    ];
    if let Some(page_table) = &options.page_table {
        bindings.push((5, page_table.buffer.as_ref()));
    }

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "attention",
            variant: &plan.variant,
            bindings: &bindings,
            workgroups: plan.workgroups,
            workgroups_desc: workgroups_desc(plan.tier),
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("seq_len", UniformValue::U32(seq_len)),
                    ("kv_len", UniformValue::U32(kv_len)),
                    ("head_dim", UniformValue::U32(head_dim)),
                    ("num_heads", UniformValue::U32(num_heads)),
                    ("scale", UniformValue::F32(scale)),
                    ("chunk_dim", UniformValue::U32(chunk_dim)),
                    ("page_size", UniformValue::U32(page_size)),
                ],
            );
        },
    )
    .await?;

    Ok(out)
}

/// Immediate attention: encode, dispatch, submit
pub async fn run_attention(
    rt: &KernelRuntime,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    options: &AttentionOptions,
) -> KernelResult<Tensor> {
    attention_impl(rt, None, q, k, v, options).await
}

/// Batched attention: append to `recorder`
pub async fn record_attention(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    options: &AttentionOptions,
) -> KernelResult<Tensor> {
    attention_impl(rt, Some(recorder), q, k, v, options).await
}
