//! Sampling operators: sample (argmax / top-K), topk, check_stop
//!
//! These are the only operators that read results back to the host, and
//! only on the immediate path; readback is gated by the process-wide
//! guard in `exec::readback`.

use crate::error::{KernelError, KernelResult};
use crate::exec::{execute, read_u32, CommandRecorder, LaunchSpec};
use crate::ops::{alloc_output, alloc_scratch, write_uniform_fields, UniformValue};
use crate::runtime::KernelRuntime;
use crate::select::{select_sample, SampleParams};
use crate::tensor::{Dtype, Tensor};

/// Per-call sampling options
#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub top_k: u32,
    pub temperature: f32,
    pub seed: u32,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            top_k: 1,
            temperature: 0.0,
            seed: 0,
        }
    }
}

/// Result of one sampling call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    pub token: u32,
    pub greedy: bool,
}

/// Top-K output tensors
#[derive(Debug, Clone)]
pub struct TopkOutput {
    pub values: Tensor,
    pub indices: Tensor,
}

struct PhaseBuffers {
    partial_vals: std::sync::Arc<wgpu::Buffer>,
    partial_idx: std::sync::Arc<wgpu::Buffer>,
}

fn phase_buffers(rt: &KernelRuntime, partials: u32, k: u32) -> PhaseBuffers {
    // Each partial lane carries a (value, index) pair.
    let lanes = u64::from(partials) * u64::from(k.max(1));
    PhaseBuffers {
        partial_vals: alloc_scratch(rt, lanes * 8, "sample partial values"),
        partial_idx: alloc_scratch(rt, lanes * 8, "sample partial indices"),
    }
}

async fn run_phase(
    rt: &KernelRuntime,
    recorder: Option<&mut CommandRecorder>,
    plan: &crate::plan::KernelPlan,
    bindings: &[(u32, &wgpu::Buffer)],
    values: &[(&str, UniformValue)],
) -> KernelResult<()> {
    let config = rt.registry().lookup("sample", &plan.variant)?;
    let uniforms = config.uniforms.clone();
    execute(
        rt,
        recorder,
        LaunchSpec {
            operation: "sample",
            variant: &plan.variant,
            bindings,
            workgroups: plan.workgroups,
            workgroups_desc: "min(default_wg, ceil(vocab / default_wg))",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| write_uniform_fields(w, &uniforms, values),
    )
    .await
}

/// Sample one token from `logits` (`[vocab]`). Greedy temperatures take
/// the two-pass argmax pipeline; otherwise top-K runs three passes and
/// the GPU draws from the renormalized candidates. The chosen token is
/// read back synchronously.
pub async fn run_sample(
    rt: &KernelRuntime,
    logits: &Tensor,
    options: &SampleOptions,
) -> KernelResult<SampleOutcome> {
    logits.check_shape("sample")?;
    let vocab = logits.element_count() as u32;
    let params = SampleParams {
        vocab,
        top_k: options.top_k,
        temperature: options.temperature,
        logits_dtype: logits.dtype,
    };
    let env = rt.selector_env();
    let phases = select_sample(&env, &params)?;
    let bufs = phase_buffers(rt, phases.partials, options.top_k);
    let result = alloc_scratch(rt, 8, "sample result");

    if phases.greedy {
        run_phase(
            rt,
            None,
            &phases.phases[0],
            &[
                (1, logits.buffer.as_ref()),
                (2, bufs.partial_vals.as_ref()),
            ],
            &[("vocab", UniformValue::U32(vocab))],
        )
        .await?;
        run_phase(
            rt,
            None,
            &phases.phases[1],
            &[
                (1, bufs.partial_vals.as_ref()),
                (2, result.as_ref()),
            ],
            &[("partials", UniformValue::U32(phases.partials))],
        )
        .await?;
    } else {
        let k = options.top_k;
        let candidates = alloc_scratch(rt, u64::from(k) * 4, "topk candidate values");
        let candidate_idx = alloc_scratch(rt, u64::from(k) * 4, "topk candidate indices");

        run_phase(
            rt,
            None,
            &phases.phases[0],
            &[
                (1, logits.buffer.as_ref()),
                (2, bufs.partial_vals.as_ref()),
                (3, bufs.partial_idx.as_ref()),
            ],
            &[
                ("vocab", UniformValue::U32(vocab)),
                ("k", UniformValue::U32(k)),
            ],
        )
        .await?;
        run_phase(
            rt,
            None,
            &phases.phases[1],
            &[
                (1, bufs.partial_vals.as_ref()),
                (2, bufs.partial_idx.as_ref()),
                (3, candidates.as_ref()),
                (4, candidate_idx.as_ref()),
            ],
            &[
                ("partials", UniformValue::U32(phases.partials)),
                ("k", UniformValue::U32(k)),
            ],
        )
        .await?;
        run_phase(
            rt,
            None,
            &phases.phases[2],
            &[
                (1, candidates.as_ref()),
                (2, candidate_idx.as_ref()),
                (3, result.as_ref()),
                (4, bufs.partial_idx.as_ref()),
            ],
            &[
                ("candidates", UniformValue::U32(k)),
                ("k", UniformValue::U32(k)),
                ("temperature", UniformValue::F32(options.temperature)),
                ("seed", UniformValue::U32(options.seed)),
            ],
        )
        .await?;

        rt.buffer_pool().release(candidates);
        rt.buffer_pool().release(candidate_idx);
    }

    let token = read_u32(rt.device(), rt.queue(), rt.buffer_pool().as_ref(), &result).await?;

    rt.buffer_pool().release(bufs.partial_vals);
    rt.buffer_pool().release(bufs.partial_idx);
    rt.buffer_pool().release(result);

    Ok(SampleOutcome {
        token,
        greedy: phases.greedy,
    })
}

async fn topk_impl(
    rt: &KernelRuntime,
    mut recorder: Option<&mut CommandRecorder>,
    logits: &Tensor,
    k: u32,
) -> KernelResult<TopkOutput> {
    logits.check_shape("topk")?;
    if k == 0 {
        return Err(KernelError::Shape {
            operation: "topk".to_string(),
            detail: "k must be positive".to_string(),
        });
    }
    let vocab = logits.element_count() as u32;
    // Force the top-K pipeline regardless of temperature.
    let params = SampleParams {
        vocab,
        top_k: k.max(2),
        temperature: 1.0,
        logits_dtype: logits.dtype,
    };
    let env = rt.selector_env();
    let phases = select_sample(&env, &params)?;
    let bufs = phase_buffers(rt, phases.partials, k);

    let values = alloc_output(rt, Dtype::F32, vec![k], "topk values");
    let indices = alloc_output(rt, Dtype::U32, vec![k], "topk indices");

    run_phase(
        rt,
        recorder.as_deref_mut(),
        &phases.phases[0],
        &[
            (1, logits.buffer.as_ref()),
            (2, bufs.partial_vals.as_ref()),
            (3, bufs.partial_idx.as_ref()),
        ],
        &[
            ("vocab", UniformValue::U32(vocab)),
            ("k", UniformValue::U32(k)),
        ],
    )
    .await?;
    run_phase(
        rt,
        recorder.as_deref_mut(),
        &phases.phases[1],
        &[
            (1, bufs.partial_vals.as_ref()),
            (2, bufs.partial_idx.as_ref()),
            (3, values.buffer.as_ref()),
            (4, indices.buffer.as_ref()),
        ],
        &[
            ("partials", UniformValue::U32(phases.partials)),
            ("k", UniformValue::U32(k)),
        ],
    )
    .await?;

    match recorder {
        Some(recorder) => {
            recorder.track_temporary(bufs.partial_vals);
            recorder.track_temporary(bufs.partial_idx);
        }
        None => {
            rt.buffer_pool().release(bufs.partial_vals);
            rt.buffer_pool().release(bufs.partial_idx);
        }
    }

    Ok(TopkOutput { values, indices })
}

/// Top-K values and indices as GPU tensors; no readback
pub async fn run_topk(rt: &KernelRuntime, logits: &Tensor, k: u32) -> KernelResult<TopkOutput> {
    topk_impl(rt, None, logits, k).await
}

pub async fn record_topk(
    rt: &KernelRuntime,
    recorder: &mut CommandRecorder,
    logits: &Tensor,
    k: u32,
) -> KernelResult<TopkOutput> {
    topk_impl(rt, Some(recorder), logits, k).await
}

/// Compare the last generated token against the stop set on the GPU and
/// read the flag back.
pub async fn run_check_stop(
    rt: &KernelRuntime,
    tokens: &Tensor,
    stop_ids: &Tensor,
    last_token: u32,
) -> KernelResult<bool> {
    tokens.check_shape("check_stop")?;
    stop_ids.check_shape("check_stop")?;
    let num_stop = stop_ids.element_count() as u32;

    let config = rt.registry().lookup("check_stop", "main")?;
    let uniforms = config.uniforms.clone();
    let flag = alloc_scratch(rt, 4, "check_stop flag");

    execute(
        rt,
        None,
        LaunchSpec {
            operation: "check_stop",
            variant: "main",
            bindings: &[
                (1, tokens.buffer.as_ref()),
                (2, stop_ids.buffer.as_ref()),
                (3, flag.as_ref()),
            ],
            workgroups: crate::plan::Workgroups::Linear(1),
            workgroups_desc: "1",
            specialization: None,
            explicit_layout: None,
            indirect: None,
        },
        |w| {
            write_uniform_fields(
                w,
                &uniforms,
                &[
                    ("num_stop", UniformValue::U32(num_stop)),
                    ("last_token", UniformValue::U32(last_token)),
                ],
            );
        },
    )
    .await?;

    let value = read_u32(rt.device(), rt.queue(), rt.buffer_pool().as_ref(), &flag).await?;
    rt.buffer_pool().release(flag);
    Ok(value != 0)
}
