//! Opaque tensor and weight handles consumed by the runtime
//!
//! The runtime never inspects tensor contents; it borrows buffers for the
//! duration of a call, reads dtype and shape to drive selection, and emits
//! GPU commands against them. Lifecycle of the underlying buffers belongs
//! to the caller (or to a recorder for tracked temporaries).

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{KernelError, KernelResult};

/// Element types understood by the selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F16,
    F32,
    Bf16,
    Q4k,
    I32,
    U32,
}

impl Dtype {
    /// Bytes per element; `None` for block-quantized formats where the
    /// per-element size is not a whole number of bytes.
    pub fn size_bytes(self) -> Option<u32> {
        match self {
            Dtype::F16 | Dtype::Bf16 => Some(2),
            Dtype::F32 | Dtype::I32 | Dtype::U32 => Some(4),
            Dtype::Q4k => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Dtype::F16 | Dtype::F32 | Dtype::Bf16)
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Dtype::Q4k)
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dtype::F16 => "f16",
            Dtype::F32 => "f32",
            Dtype::Bf16 => "bf16",
            Dtype::Q4k => "q4k",
            Dtype::I32 => "i32",
            Dtype::U32 => "u32",
        };
        write!(f, "{}", name)
    }
}

/// Memory order of a weight matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightLayout {
    RowMajor,
    ColumnMajor,
}

/// A tensor handle: buffer + dtype + shape + label
///
/// Cheap to clone; the buffer is shared. The runtime does not retain
/// clones past the call that received them, except through a recorder's
/// tracked temporaries.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub buffer: Arc<wgpu::Buffer>,
    pub dtype: Dtype,
    pub shape: Vec<u32>,
    pub label: String,
}

impl Tensor {
    pub fn new(
        buffer: Arc<wgpu::Buffer>,
        dtype: Dtype,
        shape: Vec<u32>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            buffer,
            dtype,
            shape,
            label: label.into(),
        }
    }

    /// Total element count across all axes
    pub fn element_count(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// Reject shapes with zero-sized axes, with the operation named
    pub fn check_shape(&self, operation: &str) -> KernelResult<()> {
        if self.shape.is_empty() || self.shape.iter().any(|&d| d == 0) {
            return Err(KernelError::Shape {
                operation: operation.to_string(),
                detail: format!(
                    "tensor '{}' has invalid shape {:?}",
                    self.label, self.shape
                ),
            });
        }
        Ok(())
    }
}

/// A weight buffer handle: buffer + dtype + layout + label
#[derive(Debug, Clone)]
pub struct WeightBuffer {
    pub buffer: Arc<wgpu::Buffer>,
    pub dtype: Dtype,
    pub layout: WeightLayout,
    pub label: String,
}

impl WeightBuffer {
    pub fn new(
        buffer: Arc<wgpu::Buffer>,
        dtype: Dtype,
        layout: WeightLayout,
        label: impl Into<String>,
    ) -> Self {
        Self {
            buffer,
            dtype,
            layout,
            label: label.into(),
        }
    }
}

/// Usage class passed to the buffer pool when acquiring output buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUse {
    Storage,
    StorageReadback,
    Uniform,
    Indirect,
}

impl BufferUse {
    pub fn usages(self) -> wgpu::BufferUsages {
        match self {
            BufferUse::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferUse::StorageReadback => {
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST
            }
            BufferUse::Uniform => {
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST
            }
            BufferUse::Indirect => {
                wgpu::BufferUsages::INDIRECT
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
            }
        }
    }
}

/// Buffer allocator consumed by the runtime for operator outputs and
/// staging. Owned by the embedding application; `DeviceBufferPool` is the
/// built-in implementation.
pub trait BufferPool: Send + Sync {
    fn acquire(&self, size_bytes: u64, usage: BufferUse, label: &str) -> Arc<wgpu::Buffer>;
    fn release(&self, buffer: Arc<wgpu::Buffer>);
}

/// Size-bucketed free-list pool over `wgpu::Device::create_buffer`
pub struct DeviceBufferPool {
    device: Arc<wgpu::Device>,
    free: parking_lot::Mutex<Vec<(u64, wgpu::BufferUsages, Arc<wgpu::Buffer>)>>,
}

impl DeviceBufferPool {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            free: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl BufferPool for DeviceBufferPool {
    fn acquire(&self, size_bytes: u64, usage: BufferUse, label: &str) -> Arc<wgpu::Buffer> {
        let usages = usage.usages();
        let size = size_bytes.max(4).next_multiple_of(4);

        {
            let mut free = self.free.lock();
            if let Some(pos) = free
                .iter()
                .position(|(sz, us, _)| *us == usages && *sz >= size && *sz <= size * 2)
            {
                let (_, _, buffer) = free.swap_remove(pos);
                return buffer;
            }
        }

        log::debug!("[BufferPool] Allocating {} bytes for '{}'", size, label);
        Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usages,
            mapped_at_creation: false,
        }))
    }

    fn release(&self, buffer: Arc<wgpu::Buffer>) {
        let size = buffer.size();
        let usage = buffer.usage();
        self.free.lock().push((size, usage, buffer));
    }
}
