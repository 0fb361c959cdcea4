//! Scratch uniform buffer pool
//!
//! Scratch uniforms are small, short-lived, host-written buffers. Sizes
//! round up to the uniform alignment; writes go through a little-endian
//! field writer. A scratch record bound to a recorder defers its release
//! to the recorder's flush; otherwise release returns the buffer to the
//! pool right after the dispatch is submitted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::alignment;

/// Little-endian field writer over a scratch uniform's staging bytes
pub struct UniformWriter<'a> {
    bytes: &'a mut [u8],
}

impl<'a> UniformWriter<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        let at = offset as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) {
        let at = offset as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, offset: u32, value: f32) {
        let at = offset as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// One scratch uniform allocation
pub struct ScratchUniform {
    pub buffer: Arc<wgpu::Buffer>,
    pub size: u64,
    /// Recorder this scratch was handed to, when recording
    pub recorder_id: Option<u64>,
}

/// Pool of reusable scratch uniform buffers
pub struct UniformScratchPool {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    free: Mutex<Vec<Arc<wgpu::Buffer>>>,
}

impl UniformScratchPool {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a scratch uniform whose first `size_bytes` have been
    /// filled by `writer`. The staging copy is always little-endian.
    pub fn alloc(
        &self,
        label: &str,
        size_bytes: u64,
        writer: impl FnOnce(&mut UniformWriter<'_>),
        recorder_id: Option<u64>,
    ) -> ScratchUniform {
        let rounded = alignment::align_uniform(size_bytes.max(4));

        let buffer = {
            let mut free = self.free.lock();
            match free.iter().position(|b| b.size() >= rounded) {
                Some(pos) => free.swap_remove(pos),
                None => {
                    log::trace!("[UniformPool] New {}-byte scratch for '{}'", rounded, label);
                    Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(label),
                        size: rounded,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    }))
                }
            }
        };

        let mut staging = vec![0u8; rounded as usize];
        {
            let mut field_writer = UniformWriter::new(&mut staging[..size_bytes as usize]);
            writer(&mut field_writer);
        }
        self.queue.write_buffer(&buffer, 0, &staging);

        ScratchUniform {
            buffer,
            size: rounded,
            recorder_id,
        }
    }

    /// Return a scratch buffer to the pool
    pub fn release(&self, scratch: ScratchUniform) {
        self.free.lock().push(scratch.buffer);
    }

    /// Drop all pooled buffers (device loss)
    pub fn clear(&self) {
        self.free.lock().clear();
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_writer_is_little_endian() {
        let mut bytes = [0u8; 12];
        let mut writer = UniformWriter::new(&mut bytes);
        writer.write_u32(0, 0x0102_0304);
        writer.write_f32(4, 1.0);
        writer.write_i32(8, -1);

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0xff, 0xff, 0xff, 0xff]);
    }
}
