//! Matmul operator (dense, GEMV, fused-Q4K)
//!
//! A is `[M, K]` activations, B is a weight buffer for `[K, N]` (or its
//! transpose). When the selected variant consumes f32 activations and A
//! is f16, an activation cast runs first; its temporary is tracked on the
//! recorder (batched) or returned to the pool after submit (immediate).

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, CommandRecorder, LaunchSpec};
use crate::ops::{activation, alloc_output, soft_fallback, write_uniform_fields, UniformValue};
use crate::runtime::{KernelRuntime, MatmulRole};
use crate::select::{select_matmul, MatmulParams};
use crate::tensor::{Dtype, Tensor, WeightBuffer};

/// Per-call matmul options
#[derive(Debug, Clone)]
pub struct MatmulOptions {
    pub role: MatmulRole,
    pub layer_idx: u32,
    pub wants_f16_output: bool,
    pub transpose_b: bool,
}

impl Default for MatmulOptions {
    fn default() -> Self {
        Self {
            role: MatmulRole::Generic,
            layer_idx: 0,
            wants_f16_output: false,
            transpose_b: false,
        }
    }
}

fn dims_from(a: &Tensor, n: u32) -> KernelResult<(u32, u32, u32)> {
    let &[m, k] = a.shape.as_slice() else {
        return Err(KernelError::Shape {
            operation: "matmul".to_string(),
            detail: format!("expected A [M, K], got {:?}", a.shape),
        });
    };
    Ok((m, n, k))
}

async fn matmul_impl(
    rt: &KernelRuntime,
    mut recorder: Option<&mut CommandRecorder>,
    a: &Tensor,
    b: &WeightBuffer,
    n: u32,
    options: &MatmulOptions,
) -> KernelResult<Tensor> {
    a.check_shape("matmul")?;
    let (m, n, k) = dims_from(a, n)?;

    let params = MatmulParams {
        m,
        n,
        k,
        a_dtype: a.dtype,
        b_dtype: b.dtype,
        transpose_b: options.transpose_b,
        wants_f16_output: options.wants_f16_output,
        layer_idx: options.layer_idx,
        variant_override: rt
            .overrides()
            .matmul(options.layer_idx, options.role)
            .map(|s| s.to_string()),
    };

    let env = rt.selector_env();
    let selection = soft_fallback(rt, select_matmul(&env, &params), || {
        let defaulted = MatmulParams {
            variant_override: None,
            ..params.clone()
        };
        select_matmul(&env, &defaulted)
    })?;
    let plan = &selection.plan;

    // Activation cast: f16 A into an f32 staging tensor, dispatched on
    // the same path (immediate or recorded) ahead of the matmul.
    let cast_input = if selection.needs_activation_cast {
        Some(
            activation::cast_impl(
                rt,
                recorder.as_deref_mut(),
                a,
                Dtype::F32,
                "matmul activation cast",
            )
            .await?,
        )
    } else {
        None
    };
    let a_buffer: &wgpu::Buffer = match &cast_input {
        Some(cast) => cast.buffer.as_ref(),
        None => a.buffer.as_ref(),
    };

    let out = alloc_output(rt, plan.output_dtype, vec![m, n], "matmul out");

    let config = rt.registry().lookup("matmul", &plan.variant)?;
    let uniforms = config.uniforms.clone();
    let transpose_b = u32::from(options.transpose_b);

    let bindings: Vec<(u32, &wgpu::Buffer)> = vec![
        (1, a_buffer),
        (2, b.buffer.as_ref()),
        (3, out.buffer.as_ref()),
    ];

    let desc = if plan.variant.contains("subgroup") || plan.variant.contains("multicol") {
        "ceil(N / cols_per_wg)"
    } else if plan.variant.starts_with("q4_fused_batched") {
        "N x ceil(M / tile_m)"
    } else {
        "ceil(M / wg_x) x ceil(N / (wg_y * cols_per_thread))"
    };

    execute(
        rt,
        recorder.as_deref_mut(),
        LaunchSpec {
            operation: "matmul",
            variant: &plan.variant,
            bindings: &bindings,
            workgroups: plan.workgroups,
            workgroups_desc: desc,
            specialization: None,
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
                    ("transpose_b", UniformValue::U32(transpose_b)),
                ],
            );
        },
    )
    .await?;

    // Cast temporary lifetime: the recorder owns it until flush;
    // immediate submission is ordered, so the pool may take it back now.
    if let Some(cast) = cast_input {
        match recorder {
            Some(recorder) => recorder.track_temporary(cast.buffer),
            None => rt.buffer_pool().release(cast.buffer),
        }
    }

    Ok(out)
}

/// Immediate matmul
pub async fn run_matmul(
    rt: &KernelRuntime,
    a: &Tensor,
    b: &WeightBuffer,
    n: u32,
    options: &MatmulOptions,
) -> KernelResult<Tensor> {
    matmul_impl(rt, None, a, b, n, options).await
}

/// Batched matmul
pub async fn record_matmul(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    a: &Tensor,
    b: &WeightBuffer,
    n: u32,
    options: &MatmulOptions,
) -> KernelResult<Tensor> {
    matmul_impl(rt, Some(recorder), a, b, n, options).await
}
