//! Fused FFN operator
//!
//! Gate, up, and down projections plus the activation in one kernel.
//! Input is `[batch, hidden]`; weights are the three projection matrices
//! of one layer; output is `[batch, hidden]`.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, write_uniform_fields, UniformValue};
use crate::runtime::KernelRuntime;
use crate::select::{select_ffn, FfnParams};
use crate::tensor::{Tensor, WeightBuffer};

/// Per-call fused-FFN options
#[derive(Debug, Clone, Default)]
pub struct FfnOptions {
    pub layer_idx: u32,
    pub intermediate_size: u32,
}

async fn ffn_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    w_gate: &WeightBuffer,
    w_up: &WeightBuffer,
    w_down: &WeightBuffer,
    options: &FfnOptions,
) -> KernelResult<Tensor> {
    input.check_shape("fused_ffn")?;
    let &[batch_size, hidden_size] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "fused_ffn".to_string(),
            detail: format!("expected input [batch, hidden], got {:?}", input.shape),
        });
    };
    if w_gate.dtype != w_up.dtype || w_up.dtype != w_down.dtype {
        return Err(KernelError::DtypeMismatch {
            variant: "fused_ffn".to_string(),
            detail: format!(
                "projection dtypes differ: gate={} up={} down={}",
                w_gate.dtype, w_up.dtype, w_down.dtype
            ),
        });
    }

    let params = FfnParams {
        hidden_size,
        intermediate_size: options.intermediate_size,
        batch_size,
        weight_dtype: w_gate.dtype,
    };
    let env = rt.selector_env();
    let (plan, _ctx) = select_ffn(&env, &params)?;

    let out = alloc_output(rt, plan.output_dtype, vec![batch_size, hidden_size], "ffn out");
    let config = rt.registry().lookup("fused_ffn", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "fused_ffn",
            variant: &plan.variant,
            bindings: &[
                (1, input.buffer.as_ref()),
                (2, w_gate.buffer.as_ref()),
                (3, w_up.buffer.as_ref()),
                (4, w_down.buffer.as_ref()),
                (5, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "ceil(intermediate_size / outputs_per_wg)",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("hidden_size", UniformValue::U32(hidden_size)),
                    ("intermediate_size", UniformValue::U32(options.intermediate_size)),
                    ("batch_size", UniformValue::U32(batch_size)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

/// Immediate fused FFN
pub async fn run_fused_ffn(
    rt: &KernelRuntime,
    input: &Tensor,
    w_gate: &WeightBuffer,
    w_up: &WeightBuffer,
    w_down: &WeightBuffer,
    options: &FfnOptions,
) -> KernelResult<Tensor> {
    ffn_impl(rt, None, input, w_gate, w_up, w_down, options).await
}

/// Batched fused FFN
pub async fn record_fused_ffn(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    w_gate: &WeightBuffer,
    w_up: &WeightBuffer,
    w_down: &WeightBuffer,
    options: &FfnOptions,
) -> KernelResult<Tensor> {
    ffn_impl(rt, Some(recorder), input, w_gate, w_up, w_down, options).await
}
