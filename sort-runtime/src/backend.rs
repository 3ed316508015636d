//! The device capability the sort scheduler calls through.
//!
//! A backend compiles a kernel library from source text, reports device
//! limits, owns buffer allocation and dispatches kernel launches on a single
//! in-order stream. Everything the scheduler knows about a device goes
//! through [`DeviceBackend`].

use std::collections::HashMap;
use std::fmt;

use crate::buffer::DeviceBuffer;
use crate::error::BackendError;
use crate::source::Substitutions;

/// Integer-valued device capabilities a backend can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceLimit {
    /// Maximum number of threads in one thread group (block).
    MaxThreadsPerGroup,
    /// Maximum shared (threadgroup) memory one group may allocate, in bytes.
    MaxSharedMemoryPerGroup,
}

impl fmt::Display for DeviceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLimit::MaxThreadsPerGroup => write!(f, "max threads per group"),
            DeviceLimit::MaxSharedMemoryPerGroup => write!(f, "max shared memory per group"),
        }
    }
}

/// A snapshot of the limits a scheduler sizes its launches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_threads_per_group: usize,
    pub max_shared_memory_per_group: usize,
}

impl DeviceLimits {
    /// 1024 threads, 48 KB shared memory per block.
    pub const CUDA_DEFAULT: DeviceLimits = DeviceLimits {
        max_threads_per_group: 1024,
        max_shared_memory_per_group: 49152,
    };

    /// 1024 threads, 32 KB threadgroup memory.
    pub const APPLE_SILICON: DeviceLimits = DeviceLimits {
        max_threads_per_group: 1024,
        max_shared_memory_per_group: 32768,
    };

    /// Query both limits from a backend.
    pub fn query<B: DeviceBackend + ?Sized>(backend: &B) -> Result<Self, BackendError> {
        Ok(Self {
            max_threads_per_group: backend.device_limit(DeviceLimit::MaxThreadsPerGroup)?,
            max_shared_memory_per_group: backend
                .device_limit(DeviceLimit::MaxSharedMemoryPerGroup)?,
        })
    }

    /// Look up a single limit.
    pub fn get(&self, limit: DeviceLimit) -> usize {
        match limit {
            DeviceLimit::MaxThreadsPerGroup => self.max_threads_per_group,
            DeviceLimit::MaxSharedMemoryPerGroup => self.max_shared_memory_per_group,
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::CUDA_DEFAULT
    }
}

/// Thread and memory shape of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Total threads across all groups. Backends round up to whole groups.
    pub total_threads: usize,
    /// Threads per group; `None` lets the backend pick its default width.
    pub group_size: Option<usize>,
    /// Dynamic shared memory granted to each group, in bytes.
    pub shared_memory_bytes: usize,
}

impl LaunchConfig {
    /// One thread per work item, backend-chosen group size, no shared memory.
    pub fn grid(total_threads: usize) -> Self {
        Self {
            total_threads,
            group_size: None,
            shared_memory_bytes: 0,
        }
    }

    /// Explicit group size and shared-memory grant.
    pub fn groups(total_threads: usize, group_size: usize, shared_memory_bytes: usize) -> Self {
        Self {
            total_threads,
            group_size: Some(group_size),
            shared_memory_bytes,
        }
    }

    /// Number of groups dispatched for a given group width.
    pub fn group_count(&self, group_size: usize) -> usize {
        self.total_threads.div_ceil(group_size.max(1))
    }
}

/// A positional kernel argument: argument `i` binds to slot `i` of the kernel.
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    U32(u32),
}

impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

impl<B> fmt::Debug for KernelArg<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer(_) => write!(f, "Buffer"),
            KernelArg::U32(v) => write!(f, "U32({})", v),
        }
    }
}

/// Compiled kernels keyed by function name.
pub struct KernelLibrary<K> {
    kernels: HashMap<String, K>,
}

impl<K> KernelLibrary<K> {
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, kernel: K) {
        self.kernels.insert(name.into(), kernel);
    }

    /// Remove and return the kernel named `name`.
    pub fn take(&mut self, name: &str) -> Result<K, BackendError> {
        self.kernels
            .remove(name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    /// Names of the kernels still held, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl<K> Default for KernelLibrary<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FromIterator<(String, K)> for KernelLibrary<K> {
    fn from_iter<I: IntoIterator<Item = (String, K)>>(iter: I) -> Self {
        Self {
            kernels: iter.into_iter().collect(),
        }
    }
}

/// A compute device reachable through a single in-order command stream.
///
/// Launches issued through one backend handle execute in program order;
/// a launch may block until completion or enqueue and return, but a later
/// launch always observes the writes of an earlier one.
pub trait DeviceBackend {
    type Buffer: DeviceBuffer;
    type Kernel;

    /// Substitute `substitutions` into `source` and compile every kernel it declares.
    fn compile_library(
        &self,
        source: &str,
        substitutions: &Substitutions,
    ) -> Result<KernelLibrary<Self::Kernel>, BackendError>;

    fn device_limit(&self, limit: DeviceLimit) -> Result<usize, BackendError>;

    /// Allocate `len` elements of `element_size` bytes each, zero-initialised.
    fn alloc_buffer(
        &self,
        len: usize,
        element_size: usize,
        label: &str,
    ) -> Result<Self::Buffer, BackendError>;

    /// Fill a buffer with zero bytes, ordered after every earlier launch.
    fn clear_buffer(&self, buffer: &Self::Buffer) -> Result<(), BackendError>;

    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        config: LaunchConfig,
    ) -> Result<(), BackendError>;
}
