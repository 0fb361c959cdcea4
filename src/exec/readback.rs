//! Host readback of GPU buffers
//!
//! Only the sampling operators and test hooks read results back; a
//! process-wide guard serializes the map sections so concurrent readbacks
//! cannot interleave polls.

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::tensor::{BufferPool, BufferUse};

lazy_static! {
    static ref READBACK_GUARD: Mutex<()> = Mutex::new(());
}

/// Copy `size` bytes of `source` to a staging buffer, map it, and return
/// the contents. Blocks on GPU completion; use only where the caller
/// explicitly asked for host values.
pub async fn read_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pool: &dyn BufferPool,
    source: &wgpu::Buffer,
    size: u64,
) -> KernelResult<Vec<u8>> {
    let staging = pool.acquire(size, BufferUse::StorageReadback, "readback staging");

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback copy"),
    });
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let bytes = {
        let _guard = READBACK_GUARD.lock();

        let (tx, rx) = futures::channel::oneshot::channel();
        let slice = staging.slice(..size);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);

        match rx.await {
            Ok(Ok(())) => {
                let view = slice.get_mapped_range();
                let bytes = view.to_vec();
                drop(view);
                staging.unmap();
                bytes
            }
            Ok(Err(e)) => {
                return Err(KernelError::DeviceLost {
                    context: format!("buffer map failed: {:?}", e),
                });
            }
            Err(_) => {
                return Err(KernelError::DeviceLost {
                    context: "buffer map callback dropped".to_string(),
                });
            }
        }
    };

    pool.release(staging);
    Ok(bytes)
}

/// Read a single little-endian u32 (argmax results, stop flags)
pub async fn read_u32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pool: &dyn BufferPool,
    source: &wgpu::Buffer,
) -> KernelResult<u32> {
    let bytes = read_buffer(device, queue, pool, source, 4).await?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read `count` little-endian f32 values
pub async fn read_f32s(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pool: &dyn BufferPool,
    source: &wgpu::Buffer,
    count: usize,
) -> KernelResult<Vec<f32>> {
    let bytes = read_buffer(device, queue, pool, source, (count * 4) as u64).await?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}
