//! Dispatch/record wrapper
//!
//! One execution path for every operator: resolve the pipeline, allocate
//! and write the scratch uniform, build the bind group, then either open
//! an encoder / dispatch / submit (immediate) or append a pass to the
//! caller's recorder and hand the scratch over (recording). No transient
//! state survives the call.
//!
//! Plans reaching this wrapper have passed the validator; the only checks
//! here are resource wiring and the workgroup-count limit, which indirect
//! dispatch skips.

use std::collections::BTreeMap;

use crate::cache::{LayoutId, UniformWriter};
use crate::config::BindingKind;
use crate::error::{KernelError, KernelResult};
use crate::plan::Workgroups;
use crate::exec::recorder::CommandRecorder;
use crate::runtime::KernelRuntime;

/// CPU-side layout of one indirect dispatch buffer entry
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectDispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl IndirectDispatchArgs {
    pub fn from_workgroups(workgroups: Workgroups) -> Self {
        let (x, y, z) = workgroups.to_xyz();
        Self { x, y, z }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// One kernel launch, fully described
pub struct LaunchSpec<'a> {
    pub operation: &'a str,
    pub variant: &'a str,
    /// Ordered `(binding index, buffer)` pairs for the storage slots
    pub bindings: &'a [(u32, &'a wgpu::Buffer)],
    pub workgroups: Workgroups,
    /// Human-readable formula behind the workgroup count, used in
    /// dispatch-limit errors (e.g. "seq_len * num_heads")
    pub workgroups_desc: &'a str,
    pub specialization: Option<&'a BTreeMap<String, f64>>,
    pub explicit_layout: Option<LayoutId>,
    /// Indirect dispatch buffer and offset; skips the overflow check
    pub indirect: Option<(&'a wgpu::Buffer, u64)>,
}

/// Workgroup-count limit check; indirect dispatch skips it.
pub fn check_dispatch_limit(
    operation: &str,
    workgroups: Workgroups,
    indirect: bool,
    max: u32,
    detail: &str,
) -> KernelResult<()> {
    if indirect {
        return Ok(());
    }
    let requested = workgroups.max_dim();
    if requested > max {
        return Err(KernelError::DispatchLimit {
            operation: operation.to_string(),
            requested,
            max,
            detail: detail.to_string(),
        });
    }
    Ok(())
}

/// Run one kernel launch immediately or into `recorder`.
pub async fn execute<W>(
    rt: &KernelRuntime,
    mut recorder: Option<&mut CommandRecorder>,
    spec: LaunchSpec<'_>,
    write_uniforms: W,
) -> KernelResult<()>
where
    W: FnOnce(&mut UniformWriter<'_>),
{
    let label = format!("{}/{}", spec.operation, spec.variant);

    check_dispatch_limit(
        spec.operation,
        spec.workgroups,
        spec.indirect.is_some(),
        rt.caps().get().max_workgroups_per_dim,
        spec.workgroups_desc,
    )?;

    // ResolvePipeline. The sync cache hit path covers steady state; a
    // miss awaits compilation.
    let pipeline = match rt.pipelines().get_cached_pipeline(
        spec.operation,
        spec.variant,
        spec.specialization,
    ) {
        Some(pipeline) => pipeline,
        None => {
            rt.pipelines()
                .get_or_create_pipeline(
                    spec.operation,
                    spec.variant,
                    spec.explicit_layout,
                    spec.specialization,
                )
                .await?
        }
    };

    // Resource wiring against the variant's binding schema.
    let config = rt.registry().lookup(spec.operation, spec.variant)?;
    let mut entries: Vec<(u32, &wgpu::Buffer)> = Vec::with_capacity(config.bindings.len());
    let mut uniform_slot = None;
    for slot in &config.bindings {
        match slot.kind {
            BindingKind::Uniform => {
                uniform_slot = Some(slot.index);
            }
            BindingKind::ReadStorage | BindingKind::ReadWriteStorage => {
                let buffer = spec
                    .bindings
                    .iter()
                    .find(|(index, _)| *index == slot.index)
                    .map(|(_, buffer)| *buffer)
                    .ok_or_else(|| KernelError::Config {
                        message: format!("{}: no buffer supplied for binding {}", label, slot.index),
                    })?;
                entries.push((slot.index, buffer));
            }
        }
    }
    for (index, _) in spec.bindings {
        if !config.bindings.iter().any(|slot| slot.index == *index) {
            return Err(KernelError::Config {
                message: format!("{}: binding {} not in the variant schema", label, index),
            });
        }
    }

    // AllocUniforms. After this point every path releases or hands off
    // the scratch, including the recording branch below.
    let recorder_id = recorder.as_deref().map(CommandRecorder::id);
    let scratch = uniform_slot.map(|_| {
        rt.uniform_pool().alloc(
            &label,
            u64::from(config.uniforms_size().max(4)),
            write_uniforms,
            recorder_id,
        )
    });

    // BuildBindGroup.
    let layout = match spec.explicit_layout {
        Some(id) => rt
            .pipelines()
            .layout_by_id(id)
            .ok_or_else(|| KernelError::Config {
                message: format!("{}: unknown explicit layout id", label),
            })?,
        None => std::sync::Arc::new(pipeline.get_bind_group_layout(0)),
    };

    let bind_group = {
        let mut bind_entries: Vec<wgpu::BindGroupEntry> = Vec::with_capacity(entries.len() + 1);
        if let (Some(index), Some(scratch)) = (uniform_slot, scratch.as_ref()) {
            bind_entries.push(wgpu::BindGroupEntry {
                binding: index,
                resource: scratch.buffer.as_entire_binding(),
            });
        }
        for (index, buffer) in &entries {
            bind_entries.push(wgpu::BindGroupEntry {
                binding: *index,
                resource: buffer.as_entire_binding(),
            });
        }
        rt.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&label),
            layout: &layout,
            entries: &bind_entries,
        })
    };

    let (x, y, z) = spec.workgroups.to_xyz();

    match recorder.take() {
        None => {
            // Immediate: encoder, pass, dispatch, submit, release.
            let mut encoder =
                rt.device()
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some(&label),
                    });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                match spec.indirect {
                    Some((buffer, offset)) => pass.dispatch_workgroups_indirect(buffer, offset),
                    None => pass.dispatch_workgroups(x, y, z),
                }
            }
            rt.queue().submit(std::iter::once(encoder.finish()));
            if let Some(scratch) = scratch {
                rt.uniform_pool().release(scratch);
            }
        }
        Some(recorder) => {
            // Recording: append the pass, transfer scratch ownership.
            {
                let mut pass = recorder.begin_compute_pass(&label);
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                match spec.indirect {
                    Some((buffer, offset)) => pass.dispatch_workgroups_indirect(buffer, offset),
                    None => pass.dispatch_workgroups(x, y, z),
                }
            }
            if let Some(scratch) = scratch {
                recorder.adopt_scratch(scratch);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_check_boundary_and_indirect_skip() {
        check_dispatch_limit("op", Workgroups::Linear(65_535), false, 65_535, "N").unwrap();

        let err =
            check_dispatch_limit("op", Workgroups::Linear(65_536), false, 65_535, "N").unwrap_err();
        assert!(matches!(err, KernelError::DispatchLimit { .. }));

        check_dispatch_limit("op", Workgroups::Linear(1 << 24), true, 65_535, "N").unwrap();
    }

    #[test]
    fn limit_check_covers_every_grid_axis() {
        let err = check_dispatch_limit(
            "op",
            Workgroups::Grid(1, 70_000, 1),
            false,
            65_535,
            "ceil(M / tile_m)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("ceil(M / tile_m)"));
    }

    #[test]
    fn indirect_args_layout() {
        let args = IndirectDispatchArgs::from_workgroups(Workgroups::Grid(2, 3, 4));
        assert_eq!(args.as_bytes().len(), 12);
        assert_eq!(args.as_bytes()[0..4], 2u32.to_le_bytes());
    }
}
