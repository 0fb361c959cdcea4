//! Batched command recorder
//!
//! Accumulates compute passes into one command encoder and tracks the
//! resources whose release must wait for submission: scratch uniforms
//! handed over by the dispatch wrapper and caller-marked temporary
//! buffers. `flush` submits and releases; `discard` drops the recorded
//! work and still releases, so scratch never leaks on either path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{ScratchUniform, UniformScratchPool};
use crate::tensor::BufferPool;

static NEXT_RECORDER_ID: AtomicU64 = AtomicU64::new(1);

pub struct CommandRecorder {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    uniform_pool: Arc<UniformScratchPool>,
    buffer_pool: Arc<dyn BufferPool>,
    encoder: Option<wgpu::CommandEncoder>,
    scratch: Vec<ScratchUniform>,
    temporaries: Vec<Arc<wgpu::Buffer>>,
    pass_count: u32,
    id: u64,
    label: String,
}

impl CommandRecorder {
    pub(crate) fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        uniform_pool: Arc<UniformScratchPool>,
        buffer_pool: Arc<dyn BufferPool>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            device,
            queue,
            uniform_pool,
            buffer_pool,
            encoder: None,
            scratch: Vec::new(),
            temporaries: Vec::new(),
            pass_count: 0,
            id: NEXT_RECORDER_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }

    /// The encoder, created lazily on first use
    pub fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        if self.encoder.is_none() {
            let label = format!("{} encoder", self.label);
            self.encoder = Some(self.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor {
                    label: Some(&label),
                },
            ));
        }
        self.encoder.as_mut().expect("encoder created above")
    }

    /// Open the next compute pass. Passes execute in record order.
    pub fn begin_compute_pass(&mut self, label: &str) -> wgpu::ComputePass<'_> {
        self.pass_count += 1;
        self.encoder()
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            })
    }

    /// Mark a buffer for release on flush (e.g. a cast temporary)
    pub fn track_temporary(&mut self, buffer: Arc<wgpu::Buffer>) {
        self.temporaries.push(buffer);
    }

    /// Take ownership of a scratch uniform; released on flush or discard
    pub fn adopt_scratch(&mut self, scratch: ScratchUniform) {
        self.scratch.push(scratch);
    }

    fn release_resources(&mut self) {
        for scratch in self.scratch.drain(..) {
            self.uniform_pool.release(scratch);
        }
        for buffer in self.temporaries.drain(..) {
            self.buffer_pool.release(buffer);
        }
    }

    /// Submit all recorded passes and release deferred resources.
    /// Returns `None` when nothing was recorded.
    pub fn flush(&mut self) -> Option<wgpu::SubmissionIndex> {
        let index = self.encoder.take().map(|encoder| {
            log::trace!(
                "[Recorder] Flushing '{}' ({} passes)",
                self.label,
                self.pass_count
            );
            self.queue.submit(std::iter::once(encoder.finish()))
        });
        self.release_resources();
        self.pass_count = 0;
        index
    }

    /// Drop recorded work without submitting; deferred resources are
    /// still released.
    pub fn discard(&mut self) {
        if self.encoder.take().is_some() {
            log::debug!(
                "[Recorder] Discarding '{}' ({} passes)",
                self.label,
                self.pass_count
            );
        }
        self.release_resources();
        self.pass_count = 0;
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        // A recorder dropped mid-flight behaves like discard.
        self.release_resources();
    }
}
