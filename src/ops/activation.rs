//! Elementwise and positional operators: silu, gelu, softmax, rope,
//! residual, bias_add, scale, clamp, dtype casts
//!
//! All of these are single-kernel families; selection reduces to a dtype
//! suffix. Rope is in-place: the returned tensors alias the input buffers.

use crate::constants::div_ceil;
use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, write_uniform_fields, UniformValue};
use crate::plan::Workgroups;
use crate::runtime::KernelRuntime;
use crate::rules::SelectionCtx;
use crate::tensor::{Dtype, Tensor};
use crate::validate::validate_plan;

/// Pick `main` or `main_f16` by input dtype and device f16 support
fn suffixed_variant(rt: &KernelRuntime, operation: &str, dtype: Dtype) -> KernelResult<String> {
    let variant = if dtype == Dtype::F16 && rt.caps().get().has_f16 {
        "main_f16"
    } else {
        "main"
    };
    if !rt.registry().has_variant(operation, variant) {
        return Err(KernelError::UnknownVariant {
            operation: operation.to_string(),
            variant: variant.to_string(),
        });
    }
    Ok(variant.to_string())
}

/// Shared elementwise launch: one thread per element
async fn elementwise_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    operation: &str,
    variant: &str,
    bindings: &[(u32, &wgpu::Buffer)],
    n: u32,
    extra: &[(&str, UniformValue)],
) -> KernelResult<()> {
    let ctx = SelectionCtx::new();
    validate_plan(rt.registry(), &rt.caps().get(), operation, variant, &ctx)?;
    let config = rt.registry().lookup(operation, variant)?;
    let uniforms = config.uniforms.clone();
    let workgroups = Workgroups::Linear(div_ceil(n, config.workgroup[0]));

    let mut values: Vec<(&str, UniformValue)> = vec![("n", UniformValue::U32(n))];
    values.extend_from_slice(extra);

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation,
            variant,
            bindings,
            workgroups,
            workgroups_desc: "ceil(n / workgroup_size)",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| write_uniform_fields(w, &uniforms, &values),
    )
    .await
}

async fn unary_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    operation: &str,
    input: &Tensor,
) -> KernelResult<Tensor> {
    input.check_shape(operation)?;
    let variant = suffixed_variant(rt, operation, input.dtype)?;
    let config = rt.registry().lookup(operation, &variant)?;
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(input.dtype),
        input.shape.clone(),
        operation,
    );
    let n = input.element_count() as u32;
    elementwise_impl(
        rt,
        recorder,
        operation,
        &variant,
        &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
        n,
        &[],
    )
    .await?;
    Ok(out)
}

pub async fn run_silu(rt: &KernelRuntime, input: &Tensor) -> KernelResult<Tensor> {
    unary_impl(rt, None, "silu", input).await
}

pub async fn record_silu(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
) -> KernelResult<Tensor> {
    unary_impl(rt, Some(recorder), "silu", input).await
}

pub async fn run_gelu(rt: &KernelRuntime, input: &Tensor) -> KernelResult<Tensor> {
    unary_impl(rt, None, "gelu", input).await
}

pub async fn record_gelu(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
) -> KernelResult<Tensor> {
    unary_impl(rt, Some(recorder), "gelu", input).await
}

async fn softmax_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
) -> KernelResult<Tensor> {
    input.check_shape("softmax")?;
    let &[rows, cols] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "softmax".to_string(),
            detail: format!("expected [rows, cols], got {:?}", input.shape),
        });
    };

    let variant = match input.dtype {
        Dtype::F32 => "softmax_f32",
        Dtype::F16 => "softmax_f16",
        other => {
            return Err(KernelError::DtypeMismatch {
                variant: "softmax".to_string(),
                detail: format!("expected f32 or f16, got {}", other),
            })
        }
    };

    let ctx = SelectionCtx::new();
    validate_plan(rt.registry(), &rt.caps().get(), "softmax", variant, &ctx)?;
    let config = rt.registry().lookup("softmax", variant)?;
    let uniforms = config.uniforms.clone();
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(Dtype::F32),
        input.shape.clone(),
        "softmax out",
    );

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "softmax",
            variant,
            bindings: &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
            workgroups: Workgroups::Linear(rows),
            workgroups_desc: "rows",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("rows", UniformValue::U32(rows)),
                    ("cols", UniformValue::U32(cols)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_softmax(rt: &KernelRuntime, input: &Tensor) -> KernelResult<Tensor> {
    softmax_impl(rt, None, input).await
}

pub async fn record_softmax(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
) -> KernelResult<Tensor> {
    softmax_impl(rt, Some(recorder), input).await
}

async fn rope_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    q: &Tensor,
    k: &Tensor,
    position_base: u32,
    theta: f32,
) -> KernelResult<()> {
    q.check_shape("rope")?;
    k.check_shape("rope")?;
    let &[seq_len, num_heads, head_dim] = q.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "rope".to_string(),
            detail: format!("expected Q [seq, heads, head_dim], got {:?}", q.shape),
        });
    };

    let variant = suffixed_variant(rt, "rope", q.dtype)?;
    let ctx = SelectionCtx::new();
    validate_plan(rt.registry(), &rt.caps().get(), "rope", &variant, &ctx)?;
    let config = rt.registry().lookup("rope", &variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "rope",
            variant: &variant,
            bindings: &[(1, q.buffer.as_ref()), (2, k.buffer.as_ref())],
            workgroups: Workgroups::Linear(seq_len * num_heads),
            workgroups_desc: "seq_len * num_heads",
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
                    ("head_dim", UniformValue::U32(head_dim)),
                    ("num_heads", UniformValue::U32(num_heads)),
                    ("position_base", UniformValue::U32(position_base)),
                    ("theta", UniformValue::F32(theta)),
                ],
            );
        },
    )
    .await
}

/// Rotary embedding, in place: Q and K are rotated in their own buffers.
pub async fn run_rope(
    rt: &KernelRuntime,
    q: &Tensor,
    k: &Tensor,
    position_base: u32,
    theta: f32,
) -> KernelResult<()> {
    rope_impl(rt, None, q, k, position_base, theta).await
}

pub async fn record_rope(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    q: &Tensor,
    k: &Tensor,
    position_base: u32,
    theta: f32,
) -> KernelResult<()> {
    rope_impl(rt, Some(recorder), q, k, position_base, theta).await
}

async fn residual_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    a: &Tensor,
    b: &Tensor,
) -> KernelResult<Tensor> {
    a.check_shape("residual")?;
    b.check_shape("residual")?;
    if a.shape != b.shape {
        return Err(KernelError::Shape {
            operation: "residual".to_string(),
            detail: format!("shape mismatch {:?} vs {:?}", a.shape, b.shape),
        });
    }
    let config = rt.registry().lookup("residual", "main")?;
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(Dtype::F32),
        a.shape.clone(),
        "residual out",
    );
    let n = a.element_count() as u32;
    elementwise_impl(
        rt,
        recorder,
        "residual",
        "main",
        &[
            (1, a.buffer.as_ref()),
            (2, b.buffer.as_ref()),
            (3, out.buffer.as_ref()),
        ],
        n,
        &[],
    )
    .await?;
    Ok(out)
}

pub async fn run_residual(rt: &KernelRuntime, a: &Tensor, b: &Tensor) -> KernelResult<Tensor> {
    residual_impl(rt, None, a, b).await
}

pub async fn record_residual(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    a: &Tensor,
    b: &Tensor,
) -> KernelResult<Tensor> {
    residual_impl(rt, Some(recorder), a, b).await
}

async fn bias_add_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    bias: &Tensor,
) -> KernelResult<Tensor> {
    input.check_shape("bias_add")?;
    bias.check_shape("bias_add")?;
    let bias_len = bias.element_count() as u32;
    let n = input.element_count() as u32;
    if n % bias_len != 0 {
        return Err(KernelError::Shape {
            operation: "bias_add".to_string(),
            detail: format!("bias length {} does not divide {} elements", bias_len, n),
        });
    }
    let config = rt.registry().lookup("bias_add", "main")?;
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(Dtype::F32),
        input.shape.clone(),
        "bias_add out",
    );
    elementwise_impl(
        rt,
        recorder,
        "bias_add",
        "main",
        &[
            (1, input.buffer.as_ref()),
            (2, bias.buffer.as_ref()),
            (3, out.buffer.as_ref()),
        ],
        n,
        &[("bias_len", UniformValue::U32(bias_len))],
    )
    .await?;
    Ok(out)
}

pub async fn run_bias_add(rt: &KernelRuntime, input: &Tensor, bias: &Tensor) -> KernelResult<Tensor> {
    bias_add_impl(rt, None, input, bias).await
}

pub async fn record_bias_add(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    bias: &Tensor,
) -> KernelResult<Tensor> {
    bias_add_impl(rt, Some(recorder), input, bias).await
}

async fn scale_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    factor: f32,
) -> KernelResult<Tensor> {
    input.check_shape("scale")?;
    if !factor.is_finite() {
        return Err(KernelError::Shape {
            operation: "scale".to_string(),
            detail: format!("factor {} is not finite", factor),
        });
    }
    let config = rt.registry().lookup("scale", "main")?;
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(Dtype::F32),
        input.shape.clone(),
        "scale out",
    );
    let n = input.element_count() as u32;
    elementwise_impl(
        rt,
        recorder,
        "scale",
        "main",
        &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
        n,
        &[("factor", UniformValue::F32(factor))],
    )
    .await?;
    Ok(out)
}

pub async fn run_scale(rt: &KernelRuntime, input: &Tensor, factor: f32) -> KernelResult<Tensor> {
    scale_impl(rt, None, input, factor).await
}

pub async fn record_scale(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    factor: f32,
) -> KernelResult<Tensor> {
    scale_impl(rt, Some(recorder), input, factor).await
}

async fn clamp_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    lo: f32,
    hi: f32,
) -> KernelResult<Tensor> {
    input.check_shape("clamp")?;
    if !(lo.is_finite() && hi.is_finite()) || lo > hi {
        return Err(KernelError::Shape {
            operation: "clamp".to_string(),
            detail: format!("invalid range [{}, {}]", lo, hi),
        });
    }
    let config = rt.registry().lookup("clamp", "main")?;
    let out = alloc_output(
        rt,
        config.output_dtype.unwrap_or(Dtype::F32),
        input.shape.clone(),
        "clamp out",
    );
    let n = input.element_count() as u32;
    elementwise_impl(
        rt,
        recorder,
        "clamp",
        "main",
        &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
        n,
        &[
            ("lo", UniformValue::F32(lo)),
            ("hi", UniformValue::F32(hi)),
        ],
    )
    .await?;
    Ok(out)
}

pub async fn run_clamp(
    rt: &KernelRuntime,
    input: &Tensor,
    lo: f32,
    hi: f32,
) -> KernelResult<Tensor> {
    clamp_impl(rt, None, input, lo, hi).await
}

pub async fn record_clamp(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    lo: f32,
    hi: f32,
) -> KernelResult<Tensor> {
    clamp_impl(rt, Some(recorder), input, lo, hi).await
}

/// Dtype cast; also invoked by the matmul wrapper for activation staging
pub(crate) async fn cast_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    target: Dtype,
    label: &str,
) -> KernelResult<Tensor> {
    input.check_shape("cast")?;
    let variant = match (input.dtype, target) {
        (Dtype::F16, Dtype::F32) => "f16_to_f32",
        (Dtype::F32, Dtype::F16) => "f32_to_f16",
        (Dtype::Bf16, Dtype::F32) => "bf16_to_f32",
        (from, to) => {
            return Err(KernelError::DtypeMismatch {
                variant: "cast".to_string(),
                detail: format!("no cast kernel for {} -> {}", from, to),
            })
        }
    };

    let ctx = SelectionCtx::new();
    validate_plan(rt.registry(), &rt.caps().get(), "cast", variant, &ctx)?;
    let out = alloc_output(rt, target, input.shape.clone(), label);
    let n = input.element_count() as u32;
    elementwise_impl(
        rt,
        recorder,
        "cast",
        variant,
        &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
        n,
        &[],
    )
    .await?;
    Ok(out)
}

pub async fn run_cast(rt: &KernelRuntime, input: &Tensor, target: Dtype) -> KernelResult<Tensor> {
    cast_impl(rt, None, input, target, "cast out").await
}

pub async fn record_cast(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    target: Dtype,
) -> KernelResult<Tensor> {
    cast_impl(rt, Some(recorder), input, target, "cast out").await
}
