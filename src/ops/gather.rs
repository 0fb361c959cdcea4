//! Gather (embedding lookup), scatter-add, and MoE gather operators
//!
//! MoE gather builds its bind group against the explicit layout from the
//! catalog schema because auto-layout cannot see bindings that one of the
//! shader's entry points leaves unused.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, write_uniform_fields, UniformValue};
use crate::runtime::KernelRuntime;
use crate::select::{select_gather, select_moe_gather, select_scatter_add, GatherParams};
use crate::tensor::{Dtype, Tensor, WeightBuffer};

/// Per-call gather options
#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    pub wants_f16_output: bool,
}

async fn gather_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    table: &WeightBuffer,
    indices: &Tensor,
    hidden_size: u32,
    options: &GatherOptions,
) -> KernelResult<Tensor> {
    indices.check_shape("gather")?;
    if indices.dtype != Dtype::U32 && indices.dtype != Dtype::I32 {
        return Err(KernelError::DtypeMismatch {
            variant: "gather".to_string(),
            detail: format!("indices must be integral, got {}", indices.dtype),
        });
    }
    let num_tokens = indices.element_count() as u32;

    let params = GatherParams {
        num_tokens,
        hidden_size,
        table_dtype: table.dtype,
        wants_f16_output: options.wants_f16_output,
    };
    let env = rt.selector_env();
    let (plan, _ctx, output_binding) = select_gather(&env, &params)?;

    let out = alloc_output(
        rt,
        plan.output_dtype,
        vec![num_tokens, hidden_size],
        "gather out",
    );
    let config = rt.registry().lookup("gather", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "gather",
            variant: &plan.variant,
            bindings: &[
                (1, table.buffer.as_ref()),
                (2, indices.buffer.as_ref()),
                (output_binding, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "num_tokens",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("num_tokens", UniformValue::U32(num_tokens)),
                    ("hidden_size", UniformValue::U32(hidden_size)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_gather(
    rt: &KernelRuntime,
    table: &WeightBuffer,
    indices: &Tensor,
    hidden_size: u32,
    options: &GatherOptions,
) -> KernelResult<Tensor> {
    gather_impl(rt, None, table, indices, hidden_size, options).await
}

pub async fn record_gather(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    table: &WeightBuffer,
    indices: &Tensor,
    hidden_size: u32,
    options: &GatherOptions,
) -> KernelResult<Tensor> {
    gather_impl(rt, Some(recorder), table, indices, hidden_size, options).await
}

async fn scatter_add_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    src: &Tensor,
    indices: &Tensor,
    out: &Tensor,
) -> KernelResult<()> {
    src.check_shape("scatter_add")?;
    indices.check_shape("scatter_add")?;
    out.check_shape("scatter_add")?;
    let &[num_src, hidden_size] = src.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "scatter_add".to_string(),
            detail: format!("expected src [rows, hidden], got {:?}", src.shape),
        });
    };

    let env = rt.selector_env();
    let (plan, _ctx) = select_scatter_add(&env, num_src, hidden_size)?;
    let config = rt.registry().lookup("scatter_add", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "scatter_add",
            variant: &plan.variant,
            bindings: &[
                (1, src.buffer.as_ref()),
                (2, indices.buffer.as_ref()),
                (3, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "src rows",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("num_src", UniformValue::U32(num_src)),
                    ("hidden_size", UniformValue::U32(hidden_size)),
                ],
            );
        },
    )
    .await
}

/// Scatter-add accumulates into `out` in place
pub async fn run_scatter_add(
    rt: &KernelRuntime,
    src: &Tensor,
    indices: &Tensor,
    out: &Tensor,
) -> KernelResult<()> {
    scatter_add_impl(rt, None, src, indices, out).await
}

pub async fn record_scatter_add(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    src: &Tensor,
    indices: &Tensor,
    out: &Tensor,
) -> KernelResult<()> {
    scatter_add_impl(rt, Some(recorder), src, indices, out).await
}

async fn moe_gather_impl(
    rt: &KernelRuntime,
    mut recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    expert_ids: &Tensor,
    expert_weights: &Tensor,
    experts_per_token: u32,
) -> KernelResult<Tensor> {
    input.check_shape("moe_gather")?;
    expert_ids.check_shape("moe_gather")?;
    expert_weights.check_shape("moe_gather")?;
    let &[num_tokens, hidden_size] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "moe_gather".to_string(),
            detail: format!("expected input [tokens, hidden], got {:?}", input.shape),
        });
    };

    let env = rt.selector_env();
    let (plan, _ctx) = select_moe_gather(&env, num_tokens, hidden_size, experts_per_token)?;
    let config = rt.registry().lookup("moe_gather", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    // All six bindings enumerated explicitly; see module docs.
    let (layout_id, _layout) = rt
        .pipelines()
        .get_or_create_bind_group_layout("moe_gather layout", &config.bindings);

    let scratch_bytes =
        u64::from(num_tokens) * u64::from(hidden_size) * u64::from(experts_per_token) * 4;
    let scratch = crate::ops::alloc_scratch(rt, scratch_bytes, "moe_gather scratch");
    let out = alloc_output(
        rt,
        plan.output_dtype,
        vec![num_tokens, hidden_size],
        "moe_gather out",
    );

    execute(
        rt,
        recorder.as_deref_mut(),
        LaunchSpec {
            operation: "moe_gather",
            variant: &plan.variant,
            bindings: &[
                (1, input.buffer.as_ref()),
                (2, expert_ids.buffer.as_ref()),
                (3, expert_weights.buffer.as_ref()),
                (4, scratch.as_ref()),
                (5, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "num_tokens",
            specialization: None,
            explicit_layout: Some(layout_id),
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("num_tokens", UniformValue::U32(num_tokens)),
                    ("hidden_size", UniformValue::U32(hidden_size)),
                    ("experts_per_token", UniformValue::U32(experts_per_token)),
                ],
            );
        },
    )
    .await?;

    match recorder {
        Some(recorder) => recorder.track_temporary(scratch),
        None => rt.buffer_pool().release(scratch),
    }
    Ok(out)
}

pub async fn run_moe_gather(
    rt: &KernelRuntime,
    input: &Tensor,
    expert_ids: &Tensor,
    expert_weights: &Tensor,
    experts_per_token: u32,
) -> KernelResult<Tensor> {
    moe_gather_impl(rt, None, input, expert_ids, expert_weights, experts_per_token).await
}

pub async fn record_moe_gather(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    expert_ids: &Tensor,
    expert_weights: &Tensor,
    experts_per_token: u32,
) -> KernelResult<Tensor> {
    moe_gather_impl(
        rt,
        Some(recorder),
        input,
        expert_ids,
        expert_weights,
        experts_per_token,
    )
    .await
}
