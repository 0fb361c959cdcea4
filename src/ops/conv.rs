//! Conv2D and Upsample2D operators
//!
//! Input layout is `[channels, height, width]` per image; weights are
//! `[c_out, c_in, k, k]`. Output dims follow the usual strided-conv
//! arithmetic, computed by the selector.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, write_uniform_fields, UniformValue};
use crate::runtime::KernelRuntime;
use crate::select::{
    select_conv2d, select_upsample2d, Conv2dParams, Upsample2dParams, UpsampleMode,
};
use crate::tensor::{Tensor, WeightBuffer};

/// Per-call conv2d options
#[derive(Debug, Clone)]
pub struct Conv2dOptions {
    pub kernel_size: u32,
    pub stride: u32,
    pub padding: u32,
    pub channels_out: u32,
}

/// Per-call upsample2d options
#[derive(Debug, Clone)]
pub struct Upsample2dOptions {
    pub factor: u32,
    pub mode: UpsampleMode,
}

async fn conv2d_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &Conv2dOptions,
) -> KernelResult<Tensor> {
    input.check_shape("conv2d")?;
    let &[channels_in, height, width] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "conv2d".to_string(),
            detail: format!("expected [channels, height, width], got {:?}", input.shape),
        });
    };

    let params = Conv2dParams {
        width,
        height,
        channels_in,
        channels_out: options.channels_out,
        kernel_size: options.kernel_size,
        stride: options.stride,
        padding: options.padding,
        dtype: input.dtype,
    };
    let env = rt.selector_env();
    let (plan, _ctx) = select_conv2d(&env, &params)?;
    let (out_w, out_h) = params.output_size()?;

    let out = alloc_output(
        rt,
        plan.output_dtype,
        vec![options.channels_out, out_h, out_w],
        "conv2d out",
    );
    let config = rt.registry().lookup("conv2d", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "conv2d",
            variant: &plan.variant,
            bindings: &[
                (1, input.buffer.as_ref()),
                (2, weight.buffer.as_ref()),
                (3, bias.buffer.as_ref()),
                (4, out.buffer.as_ref()),
            ],
            workgroups: plan.workgroups,
            workgroups_desc: "ceil(out_w / 8) x ceil(out_h / 8) x c_out",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("width", UniformValue::U32(width)),
                    ("height", UniformValue::U32(height)),
                    ("channels_in", UniformValue::U32(channels_in)),
                    ("channels_out", UniformValue::U32(options.channels_out)),
                    ("kernel_size", UniformValue::U32(options.kernel_size)),
                    ("stride", UniformValue::U32(options.stride)),
                    ("padding", UniformValue::U32(options.padding)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_conv2d(
    rt: &KernelRuntime,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &Conv2dOptions,
) -> KernelResult<Tensor> {
    conv2d_impl(rt, None, input, weight, bias, options).await
}

pub async fn record_conv2d(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    weight: &WeightBuffer,
    bias: &WeightBuffer,
    options: &Conv2dOptions,
) -> KernelResult<Tensor> {
    conv2d_impl(rt, Some(recorder), input, weight, bias, options).await
}

async fn upsample2d_impl(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    input: &Tensor,
    options: &Upsample2dOptions,
) -> KernelResult<Tensor> {
    input.check_shape("upsample2d")?;
    let &[channels, height, width] = input.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "upsample2d".to_string(),
            detail: format!("expected [channels, height, width], got {:?}", input.shape),
        });
    };

    let params = Upsample2dParams {
        width,
        height,
        channels,
        factor: options.factor,
        mode: options.mode,
    };
    let env = rt.selector_env();
    let (plan, _ctx) = select_upsample2d(&env, &params)?;

    let out = alloc_output(
        rt,
        plan.output_dtype,
        vec![channels, height * options.factor, width * options.factor],
        "upsample2d out",
    );
    let config = rt.registry().lookup("upsample2d", &plan.variant)?;
    let uniforms = config.uniforms.clone();

    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "upsample2d",
            variant: &plan.variant,
            bindings: &[(1, input.buffer.as_ref()), (2, out.buffer.as_ref())],
            workgroups: plan.workgroups,
            workgroups_desc: "ceil(dst_w / 8) x ceil(dst_h / 8) x channels",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("src_width", UniformValue::U32(width)),
                    ("src_height", UniformValue::U32(height)),
                    ("channels", UniformValue::U32(channels)),
                    ("factor", UniformValue::U32(options.factor)),
                ],
            );
        },
    )
    .await?;
    Ok(out)
}

pub async fn run_upsample2d(
    rt: &KernelRuntime,
    input: &Tensor,
    options: &Upsample2dOptions,
) -> KernelResult<Tensor> {
    upsample2d_impl(rt, None, input, options).await
}

pub async fn record_upsample2d(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    input: &Tensor,
    options: &Upsample2dOptions,
) -> KernelResult<Tensor> {
    upsample2d_impl(rt, Some(recorder), input, options).await
}
