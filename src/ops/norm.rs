//! Normalization operators: rmsnorm, layernorm, groupnorm, and the
//! matmul+rmsnorm fusion
//!
//! RMSNorm flavor switches (Gemma offset, sandwich residual, f16 weights)
//! are baked in as pipeline specialization constants rather than runtime
//! branches.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, write_uniform_fields, UniformValue};
use crate::runtime::KernelRuntime;
use crate::select::{
    select_fused_matmul_rmsnorm, select_groupnorm, select_layernorm, select_rmsnorm,
    RmsNormOptions,
};
use crate::tensor::{Tensor, WeightBuffer};

/// Per-call norm options
#[derive(Debug, Clone)]
pub struct NormOptions {
    pub eps: f32,
    pub rms: RmsNormOptions,
}

impl Default for NormOptions {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            rms: RmsNormOptions::default(),
        }
    }
}

/// Per-call groupnorm options
#[derive(Debug, Clone)]
pub struct GroupNormOptions {
    pub groups: u32,
    pub eps: f32,
}

impl Default for GroupNormOptions {
    fn default() -> Self {
        Self {
            groups: 32,
            eps: 1e-5,
        }
    }
}

fn row_dims(input: &Tensor, operation: &str) -> KernelResult<(u32, u32)> {
    let &[batch, hidden] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: operation.to_string(),
            detail: format!("expected [batch, hidden], got {:?}", input.shape),
        });
    };
    Ok((batch, hidden))
}

async fn rmsnorm_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    weight: &WeightBuffer,
    residual: Option<&Tensor>,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    input.check_shape("rmsnorm")?;
    let (batch, hidden) = row_dims(input, "rmsnorm")?;
    if options.rms.has_residual != residual.is_some() {
        return Err(KernelError::Shape {
            operation: "rmsnorm".to_string(),
            detail: "HAS_RESIDUAL specialization disagrees with residual input".to_string(),
        });
    }

    let env = rt.selector_env();
    let (plan, _ctx) = select_rmsnorm(&env, hidden, batch)?;
    let spec = options.rms.specialization();

    let out = alloc_output(rt, plan.output_dtype, input.shape.clone(), "rmsnorm out");
    let config = rt.registry().lookup("rmsnorm", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    let mut bindings: Vec<(u32, &wgpu::Buffer)> = vec![
        (1, input.buffer.as_ref()),
        (2, weight.buffer.as_ref()),
        (3, out.buffer.as_ref()),
    ];
    if let Some(residual) = residual {
        bindings.push((4, residual.buffer.as_ref()));
    } else {
        // The layout keeps slot 4; bind the input as a harmless filler
        // when the specialization compiles the residual path out.
        bindings.push((4, input.buffer.as_ref()));
    }

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "rmsnorm",
            variant: &plan.variant,
            bindings: &bindings,
            workgroups: plan.workgroups,
            workgroups_desc: "batch rows",
            specialization: Some(&spec),
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("hidden_size", UniformValue::U32(hidden)),
                    ("batch_size", UniformValue::U32(batch)),
                    ("eps", UniformValue::F32(options.eps)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_rmsnorm(
    rt: &KernelRuntime,
    input: &Tensor,
    weight: &WeightBuffer,
    residual: Option<&Tensor>,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    rmsnorm_impl(rt, None, input, weight, residual, options).await
}

pub async fn record_rmsnorm(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    weight: &WeightBuffer,
    residual: Option<&Tensor>,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    rmsnorm_impl(rt, Some(recorder), input, weight, residual, options).await
}

async fn layernorm_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    eps: f32,
) -> KernelResult<Tensor> {
    input.check_shape("layernorm")?;
    let (batch, hidden) = row_dims(input, "layernorm")?;

    let env = rt.selector_env();
    let (plan, _ctx) = select_layernorm(&env, hidden, batch)?;
    let out = alloc_output(rt, plan.output_dtype, input.shape.clone(), "layernorm out");
    let config = rt.registry().lookup("layernorm", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "layernorm",
            variant: &plan.variant,
            bindings: &[
                (1, input.buffer.as_ref()),
                (2, weight.buffer.as_ref()),
                (3, bias.buffer.as_ref()),
                (4, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "batch rows",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("hidden_size", UniformValue::U32(hidden)),
                    ("batch_size", UniformValue::U32(batch)),
                    ("eps", UniformValue::F32(eps)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_layernorm(
    rt: &KernelRuntime,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    eps: f32,
) -> KernelResult<Tensor> {
    layernorm_impl(rt, None, input, weight, bias, eps).await
}

pub async fn record_layernorm(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    eps: f32,
) -> KernelResult<Tensor> {
    layernorm_impl(rt, Some(recorder), input, weight, bias, eps).await
}

async fn groupnorm_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &GroupNormOptions,
) -> KernelResult<Tensor> {
    input.check_shape("groupnorm")?;
    let &[batch, channels, spatial] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "groupnorm".to_string(),
            detail: format!("expected [batch, channels, spatial], got {:?}", input.shape),
        });
    };

    let env = rt.selector_env();
    let (plan, _ctx) = select_groupnorm(&env, channels, options.groups, batch)?;
    let out = alloc_output(rt, plan.output_dtype, input.shape.clone(), "groupnorm out");
    let config = rt.registry().lookup("groupnorm", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "groupnorm",
            variant: &plan.variant,
            bindings: &[
                (1, input.buffer.as_ref()),
                (2, weight.buffer.as_ref()),
                (3, bias.buffer.as_ref()),
                (4, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "groups * batch",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("channels", UniformValue::U32(channels)),
                    ("groups", UniformValue::U32(options.groups)),
                    ("spatial", UniformValue::U32(spatial)),
                    ("eps", UniformValue::F32(options.eps)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_groupnorm(
    rt: &KernelRuntime,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &GroupNormOptions,
) -> KernelResult<Tensor> {
    groupnorm_impl(rt, None, input, weight, bias, options).await
}

pub async fn record_groupnorm(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &GroupNormOptions,
) -> KernelResult<Tensor> {
    groupnorm_impl(rt, Some(recorder), input, weight, bias, options).await
}

async fn fused_matmul_rmsnorm_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    a: &Tensor,
    b: &WeightBuffer,
    norm_weight: &WeightBuffer,
    n: u32,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    a.check_shape("fused_matmul_rmsnorm")?;
    let &[m, k] = a.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "fused_matmul_rmsnorm".to_string(),
            detail: format!("expected A [M, K], got {:?}", a.shape),
        });
    };

    let env = rt.selector_env();
    let (plan, _ctx) = select_fused_matmul_rmsnorm(&env, m, n, k)?;
    let mut spec = options.rms.specialization();
    spec.remove("HAS_RESIDUAL");

    let out = alloc_output(rt, plan.output_dtype, vec![m, n], "fused_matmul_rmsnorm out");
    let config = rt.registry().lookup("fused_matmul_rmsnorm", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "fused_matmul_rmsnorm",
            variant: &plan.variant,
            bindings: &[
                (1, a.buffer.as_ref()),
                (2, b.buffer.as_ref()),
                (3, norm_weight.buffer.as_ref()),
                (4, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "M rows",
            specialization: Some(&spec),
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("m", UniformValue::U32(m)),
                    ("n", UniformValue::U32(n)),
                    ("k", UniformValue::U32(k)),
                    ("eps", UniformValue::F32(options.eps)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_fused_matmul_rmsnorm(
    rt: &KernelRuntime,
    a: &Tensor,
    b: &WeightBuffer,
    norm_weight: &WeightBuffer,
    n: u32,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    fused_matmul_rmsnorm_impl(rt, None, a, b, norm_weight, n, options).await
}

pub async fn record_fused_matmul_rmsnorm(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    a: &Tensor,
    b: &WeightBuffer,
    norm_weight: &WeightBuffer,
    n: u32,
    options: &NormOptions,
) -> KernelResult<Tensor> {
    fused_matmul_rmsnorm_impl(rt, Some(recorder), a, b, norm_weight, n, options).await
}
