//! Metal implementation of [`DeviceBackend`] (macOS only).
//!
//! Kernels are compiled at runtime from substituted MSL source. Every launch
//! gets its own command buffer and is waited on before returning, so the
//! in-order guarantee holds trivially.

use std::ffi::c_void;
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
    MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice,
    MTLLibrary, MTLResource, MTLResourceOptions, MTLSize,
};
use tracing::{debug, trace};

use crate::backend::{DeviceBackend, DeviceLimit, KernelArg, KernelLibrary, LaunchConfig};
use crate::buffer::DeviceBuffer;
use crate::error::BackendError;
use crate::source::{kernel_names, Substitutions};

/// Threadgroup memory grants must be a multiple of this many bytes.
const THREADGROUP_MEMORY_GRANULE: usize = 16;

/// Threads per group when a launch leaves the choice to the backend.
const DEFAULT_GROUP_SIZE: usize = 256;

/// A compiled compute pipeline and the function it was built from.
pub struct MetalKernel {
    name: String,
    pipeline: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
}

impl MetalKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A `StorageModeShared` Metal buffer with a record count and stride.
pub struct MetalBuffer {
    buffer: Retained<ProtocolObject<dyn MTLBuffer>>,
    len: usize,
    element_size: usize,
}

impl MetalBuffer {
    pub fn raw(&self) -> &ProtocolObject<dyn MTLBuffer> {
        &self.buffer
    }

    /// Overwrite the whole buffer. `data` must be exactly `byte_len()` bytes.
    pub fn upload<T: bytemuck::Pod>(&self, data: &[T]) -> Result<(), BackendError> {
        let src: &[u8] = bytemuck::cast_slice(data);
        if src.len() != self.byte_len() {
            return Err(BackendError::SizeMismatch {
                expected: self.byte_len(),
                actual: src.len(),
            });
        }
        // SAFETY: shared storage is CPU-visible and at least byte_len() long;
        // no command buffer is in flight between launches.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.buffer.contents().as_ptr() as *mut u8,
                src.len(),
            );
        }
        Ok(())
    }

    /// Copy the contents out as `T` values.
    pub fn download<T: bytemuck::Pod>(&self) -> Vec<T> {
        // SAFETY: see `upload`.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.buffer.contents().as_ptr() as *const u8, self.byte_len())
        };
        bytemuck::pod_collect_to_vec::<u8, T>(bytes)
    }
}

impl DeviceBuffer for MetalBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn element_size(&self) -> usize {
        self.element_size
    }
}

/// The system default Metal device and one command queue.
pub struct MetalBackend {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
}

impl MetalBackend {
    pub fn new() -> Result<Self, BackendError> {
        let device = MTLCreateSystemDefaultDevice().ok_or(BackendError::DeviceNotFound)?;
        let queue = device
            .newCommandQueue()
            .ok_or_else(|| BackendError::GpuExecution("failed to create command queue".into()))?;
        debug!(device = %device.name(), "metal backend initialized");
        Ok(Self { device, queue })
    }

    /// Allocate a buffer of `T` records holding a copy of `data`.
    pub fn buffer_from_slice<T: bytemuck::Pod>(
        &self,
        data: &[T],
        label: &str,
    ) -> Result<MetalBuffer, BackendError> {
        let buffer = self.alloc_buffer(data.len(), std::mem::size_of::<T>(), label)?;
        buffer.upload(data)?;
        Ok(buffer)
    }

    fn compile_kernel(
        &self,
        library: &ProtocolObject<dyn MTLLibrary>,
        name: &str,
    ) -> Result<MetalKernel, BackendError> {
        let fn_name = NSString::from_str(name);
        let function = library
            .newFunctionWithName(&fn_name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_string()))?;
        let pipeline = self
            .device
            .newComputePipelineStateWithFunction_error(&function)
            .map_err(|e| BackendError::ShaderCompilation(format!("PSO '{}': {}", name, e)))?;
        Ok(MetalKernel {
            name: name.to_string(),
            pipeline,
        })
    }
}

impl DeviceBackend for MetalBackend {
    type Buffer = MetalBuffer;
    type Kernel = MetalKernel;

    fn compile_library(
        &self,
        source: &str,
        substitutions: &Substitutions,
    ) -> Result<KernelLibrary<MetalKernel>, BackendError> {
        let text = substitutions.apply(source);
        let ns_source = NSString::from_str(&text);
        let library = self
            .device
            .newLibraryWithSource_options_error(&ns_source, None)
            .map_err(|e| BackendError::ShaderCompilation(e.to_string()))?;

        let mut kernels = KernelLibrary::new();
        for name in kernel_names(&text) {
            let pso = self.compile_kernel(&library, &name)?;
            kernels.insert(name, pso);
        }
        debug!(kernels = kernels.len(), "metal kernel library compiled");
        Ok(kernels)
    }

    fn device_limit(&self, limit: DeviceLimit) -> Result<usize, BackendError> {
        let value = match limit {
            DeviceLimit::MaxThreadsPerGroup => self.device.maxThreadsPerThreadgroup().width,
            DeviceLimit::MaxSharedMemoryPerGroup => self.device.maxThreadgroupMemoryLength(),
        };
        if value == 0 {
            return Err(BackendError::LimitUnavailable(limit));
        }
        Ok(value)
    }

    fn alloc_buffer(
        &self,
        len: usize,
        element_size: usize,
        label: &str,
    ) -> Result<MetalBuffer, BackendError> {
        let bytes = len.saturating_mul(element_size);
        // Zero-length Metal buffers are invalid; keep one byte.
        let buffer = self
            .device
            .newBufferWithLength_options(bytes.max(1), MTLResourceOptions::StorageModeShared)
            .ok_or_else(|| BackendError::Allocation {
                label: label.to_string(),
                bytes,
            })?;
        buffer.setLabel(Some(&NSString::from_str(label)));
        let buffer = MetalBuffer {
            buffer,
            len,
            element_size,
        };
        // Fresh shared buffers are not guaranteed to be zeroed.
        self.clear_buffer(&buffer)?;
        Ok(buffer)
    }

    fn clear_buffer(&self, buffer: &MetalBuffer) -> Result<(), BackendError> {
        // SAFETY: launches wait for completion, so the GPU holds no reference.
        unsafe {
            std::ptr::write_bytes(
                buffer.buffer.contents().as_ptr() as *mut u8,
                0,
                buffer.byte_len(),
            );
        }
        Ok(())
    }

    fn launch(
        &self,
        kernel: &MetalKernel,
        args: &[KernelArg<'_, MetalBuffer>],
        config: LaunchConfig,
    ) -> Result<(), BackendError> {
        let label = kernel.name.as_str();
        let pipeline_max = kernel.pipeline.maxTotalThreadsPerThreadgroup();
        let group_size = config
            .group_size
            .unwrap_or_else(|| pipeline_max.min(DEFAULT_GROUP_SIZE));
        if config.total_threads == 0 {
            return Err(BackendError::invalid_launch(label, "zero threads"));
        }
        if group_size == 0 || group_size > pipeline_max {
            return Err(BackendError::invalid_launch(
                label,
                format!("group size {} outside 1..={}", group_size, pipeline_max),
            ));
        }
        let shared_max = self.device.maxThreadgroupMemoryLength();
        if config.shared_memory_bytes > shared_max {
            return Err(BackendError::invalid_launch(
                label,
                format!(
                    "shared memory grant {} exceeds {} bytes",
                    config.shared_memory_bytes, shared_max
                ),
            ));
        }

        let cmd = self
            .queue
            .commandBuffer()
            .ok_or_else(|| BackendError::GpuExecution("failed to create command buffer".into()))?;
        let enc = cmd
            .computeCommandEncoder()
            .ok_or_else(|| BackendError::GpuExecution("failed to create compute encoder".into()))?;
        enc.setComputePipelineState(&kernel.pipeline);

        // Scalars must stay alive until encoding copies them.
        let scalars: Vec<u32> = args
            .iter()
            .map(|arg| match arg {
                KernelArg::U32(v) => *v,
                KernelArg::Buffer(_) => 0,
            })
            .collect();
        for (index, arg) in args.iter().enumerate() {
            match arg {
                KernelArg::Buffer(buf) => unsafe {
                    enc.setBuffer_offset_atIndex(Some(buf.raw()), 0, index);
                },
                KernelArg::U32(_) => unsafe {
                    let ptr = NonNull::from(&scalars[index]).cast::<c_void>();
                    enc.setBytes_length_atIndex(ptr, std::mem::size_of::<u32>(), index);
                },
            }
        }

        if config.shared_memory_bytes > 0 {
            let grant = config.shared_memory_bytes.next_multiple_of(THREADGROUP_MEMORY_GRANULE);
            // SAFETY: the grant is within the device limit checked above.
            unsafe {
                enc.setThreadgroupMemoryLength_atIndex(grant, 0);
            }
        }

        let grid = MTLSize {
            width: config.group_count(group_size),
            height: 1,
            depth: 1,
        };
        let tg_size = MTLSize {
            width: group_size,
            height: 1,
            depth: 1,
        };
        trace!(
            kernel = %label,
            groups = grid.width,
            group_size,
            shared_memory_bytes = config.shared_memory_bytes,
            "metal launch"
        );
        enc.dispatchThreadgroups_threadsPerThreadgroup(grid, tg_size);
        enc.endEncoding();
        cmd.commit();
        cmd.waitUntilCompleted();

        if cmd.status() == MTLCommandBufferStatus::Error {
            let reason = cmd
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "command buffer error".to_string());
            return Err(BackendError::GpuExecution(format!("{}: {}", label, reason)));
        }
        Ok(())
    }
}
