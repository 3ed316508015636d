//! In-process reference device.
//!
//! [`HostBackend`] runs the sort kernel library with host code while holding
//! itself to a device's rules: every launch is checked against the configured
//! [`DeviceLimits`], shared-memory grants are checked against what the kernel
//! needs, and every launch and clear is appended to an event log that tests
//! can inspect.

mod buffer;
mod kernels;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ptr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

pub use buffer::HostBuffer;

use crate::backend::{DeviceBackend, DeviceLimit, DeviceLimits, KernelArg, KernelLibrary, LaunchConfig};
use crate::error::BackendError;
use crate::source::{kernel_names, Substitutions};
use kernels::HostOp;

/// A record's sort key at its full width.
///
/// Keys of one layout always share a variant. Floats order by `total_cmp`.
#[derive(Debug, Clone, Copy)]
pub enum HostKey {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl HostKey {
    /// Monotone image of the key on the real line. Rounds 64-bit integers,
    /// so it is only used to place keys in buckets, never to order them.
    pub fn to_f64(self) -> f64 {
        match self {
            HostKey::Unsigned(v) => v as f64,
            HostKey::Signed(v) => v as f64,
            HostKey::Float(v) => v,
        }
    }
}

impl Ord for HostKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (*self, *other) {
            (HostKey::Unsigned(a), HostKey::Unsigned(b)) => a.cmp(&b),
            (HostKey::Signed(a), HostKey::Signed(b)) => a.cmp(&b),
            (HostKey::Float(a), HostKey::Float(b)) => a.total_cmp(&b),
            (a, b) => a.to_f64().total_cmp(&b.to_f64()),
        }
    }
}

impl PartialOrd for HostKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HostKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HostKey {}

macro_rules! host_key_from {
    ($variant:ident, $wide:ty, $($t:ty),+) => {
        $(impl From<$t> for HostKey {
            fn from(v: $t) -> Self {
                HostKey::$variant(v as $wide)
            }
        })+
    };
}

host_key_from!(Unsigned, u64, u8, u16, u32, u64);
host_key_from!(Signed, i64, i8, i16, i32, i64);
host_key_from!(Float, f64, f32, f64);

/// Extracts the sort key of one record from its raw bytes.
pub type KeyFn = Arc<dyn Fn(&[u8]) -> HostKey + Send + Sync>;

/// Threads per group when a launch leaves the choice to the backend.
const DEFAULT_GROUP_SIZE: usize = 256;

/// How the host reads the key out of a record type.
#[derive(Clone)]
pub struct HostLayout {
    key: KeyFn,
    /// Bytes of the record the key function reads.
    key_width: usize,
}

impl HostLayout {
    pub fn new<K, F>(key_width: usize, key: F) -> Self
    where
        K: Into<HostKey>,
        F: Fn(&[u8]) -> K + Send + Sync + 'static,
    {
        Self {
            key: Arc::new(move |record: &[u8]| -> HostKey { key(record).into() }),
            key_width,
        }
    }
}

/// A kernel bound to a host implementation and the record layout it was compiled for.
pub struct HostKernel {
    name: String,
    op: HostOp,
    layout: HostLayout,
}

impl HostKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One observable device operation, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Launch { kernel: String, config: LaunchConfig },
    Clear { label: String },
}

struct HostState {
    limits: DeviceLimits,
    withheld: RwLock<HashSet<DeviceLimit>>,
    layouts: RwLock<HashMap<(String, String), HostLayout>>,
    failing: RwLock<HashSet<String>>,
    events: Mutex<Vec<HostEvent>>,
    allocations: Mutex<Vec<String>>,
}

/// Reference backend executing kernels on the host. Cloning shares the device.
#[derive(Clone)]
pub struct HostBackend {
    state: Arc<HostState>,
}

impl HostBackend {
    /// A host device reporting `limits`, with the built-in record layouts registered.
    pub fn new(limits: DeviceLimits) -> Self {
        let backend = Self {
            state: Arc::new(HostState {
                limits,
                withheld: RwLock::new(HashSet::new()),
                layouts: RwLock::new(HashMap::new()),
                failing: RwLock::new(HashSet::new()),
                events: Mutex::new(Vec::new()),
                allocations: Mutex::new(Vec::new()),
            }),
        };
        backend.register_builtin_layouts();
        backend
    }

    fn register_builtin_layouts(&self) {
        self.register_layout("uint", "value", HostLayout::new(4, |r| read::<u32>(r, 0)));
        self.register_layout("int", "value", HostLayout::new(4, |r| read::<i32>(r, 0)));
        self.register_layout("float", "value", HostLayout::new(4, |r| read::<f32>(r, 0)));
        self.register_layout("ulong", "value", HostLayout::new(8, |r| read::<u64>(r, 0)));
        self.register_layout("long", "value", HostLayout::new(8, |r| read::<i64>(r, 0)));
        self.register_layout("uint2", "value.x", HostLayout::new(4, |r| read::<u32>(r, 0)));
        self.register_layout("float2", "value.x", HostLayout::new(4, |r| read::<f32>(r, 0)));
    }

    /// Teach the host how to key records of `data_type` under the `sort_key` expression.
    pub fn register_layout(&self, data_type: &str, sort_key: &str, layout: HostLayout) {
        self.state
            .layouts
            .write()
            .insert((data_type.to_string(), sort_key.to_string()), layout);
    }

    /// Limits as configured, including any withheld from `device_limit`.
    pub fn limits(&self) -> DeviceLimits {
        self.state.limits
    }

    /// Make `device_limit` fail for `limit`, as a device that cannot report it would.
    pub fn withhold_limit(&self, limit: DeviceLimit) {
        self.state.withheld.write().insert(limit);
    }

    /// Make every later launch of `kernel` fail with [`BackendError::GpuExecution`].
    pub fn fail_kernel(&self, kernel: &str) {
        self.state.failing.write().insert(kernel.to_string());
    }

    /// Launches and clears issued so far, oldest first.
    pub fn events(&self) -> Vec<HostEvent> {
        self.state.events.lock().clone()
    }

    /// `(kernel, config)` for each launch issued so far.
    pub fn launches(&self) -> Vec<(String, LaunchConfig)> {
        self.state
            .events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HostEvent::Launch { kernel, config } => Some((kernel.clone(), *config)),
                HostEvent::Clear { .. } => None,
            })
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        self.launches().len()
    }

    pub fn reset_events(&self) {
        self.state.events.lock().clear();
    }

    /// Labels of every buffer allocated through this backend.
    pub fn allocations(&self) -> Vec<String> {
        self.state.allocations.lock().clone()
    }

    /// Allocate a buffer of `T` records holding a copy of `data`.
    pub fn buffer_from_slice<T: bytemuck::Pod>(
        &self,
        data: &[T],
        label: &str,
    ) -> Result<HostBuffer, BackendError> {
        let buffer = self.alloc_buffer(data.len(), std::mem::size_of::<T>(), label)?;
        buffer.upload(data)?;
        Ok(buffer)
    }

    fn validate_launch(
        &self,
        kernel: &HostKernel,
        args: &[KernelArg<'_, HostBuffer>],
        config: &LaunchConfig,
    ) -> Result<usize, BackendError> {
        let limits = self.state.limits;
        let group_size = config
            .group_size
            .unwrap_or_else(|| DEFAULT_GROUP_SIZE.min(limits.max_threads_per_group));

        if config.total_threads == 0 {
            return Err(BackendError::invalid_launch(&kernel.name, "zero threads"));
        }
        if group_size == 0 || group_size > limits.max_threads_per_group {
            return Err(BackendError::invalid_launch(
                &kernel.name,
                format!(
                    "group size {} outside 1..={}",
                    group_size, limits.max_threads_per_group
                ),
            ));
        }
        if config.shared_memory_bytes > limits.max_shared_memory_per_group {
            return Err(BackendError::invalid_launch(
                &kernel.name,
                format!(
                    "shared memory grant {} exceeds {} bytes",
                    config.shared_memory_bytes, limits.max_shared_memory_per_group
                ),
            ));
        }

        let buffers: Vec<&HostBuffer> = args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Buffer(buf) => Some(*buf),
                KernelArg::U32(_) => None,
            })
            .collect();
        for (i, a) in buffers.iter().enumerate() {
            if buffers[i + 1..].iter().any(|b| ptr::eq(*a, *b)) {
                return Err(BackendError::invalid_launch(
                    &kernel.name,
                    format!("buffer '{}' bound twice", a.label()),
                ));
            }
        }
        Ok(group_size)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

fn read<T: bytemuck::Pod>(record: &[u8], offset: usize) -> T {
    bytemuck::pod_read_unaligned(&record[offset..offset + std::mem::size_of::<T>()])
}

impl DeviceBackend for HostBackend {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn compile_library(
        &self,
        source: &str,
        substitutions: &Substitutions,
    ) -> Result<KernelLibrary<HostKernel>, BackendError> {
        let text = substitutions.apply(source);
        let data_type = substitutions.get("DATA_TYPE").ok_or_else(|| {
            BackendError::ShaderCompilation("DATA_TYPE has no substitution".to_string())
        })?;
        let sort_key = substitutions.get("SORT_KEY").ok_or_else(|| {
            BackendError::ShaderCompilation("SORT_KEY has no substitution".to_string())
        })?;
        let layout = self
            .state
            .layouts
            .read()
            .get(&(data_type.to_string(), sort_key.to_string()))
            .cloned()
            .ok_or_else(|| {
                BackendError::ShaderCompilation(format!(
                    "no host layout for {} keyed by '{}'",
                    data_type, sort_key
                ))
            })?;

        let names = kernel_names(&text);
        if names.is_empty() {
            return Err(BackendError::ShaderCompilation(
                "source declares no kernels".to_string(),
            ));
        }

        let mut library = KernelLibrary::new();
        for name in names {
            let op = HostOp::from_name(&name).ok_or_else(|| {
                BackendError::ShaderCompilation(format!("no host implementation of '{}'", name))
            })?;
            library.insert(
                name.clone(),
                HostKernel {
                    name,
                    op,
                    layout: layout.clone(),
                },
            );
        }
        debug!(
            kernels = library.len(),
            data_type, sort_key, "host kernel library compiled"
        );
        Ok(library)
    }

    fn device_limit(&self, limit: DeviceLimit) -> Result<usize, BackendError> {
        if self.state.withheld.read().contains(&limit) {
            return Err(BackendError::LimitUnavailable(limit));
        }
        // A device reporting 0 has not reported the limit.
        match self.state.limits.get(limit) {
            0 => Err(BackendError::LimitUnavailable(limit)),
            value => Ok(value),
        }
    }

    fn alloc_buffer(
        &self,
        len: usize,
        element_size: usize,
        label: &str,
    ) -> Result<HostBuffer, BackendError> {
        let bytes = len.checked_mul(element_size).ok_or_else(|| BackendError::Allocation {
            label: label.to_string(),
            bytes: usize::MAX,
        })?;
        trace!(label, bytes, "host buffer allocated");
        self.state.allocations.lock().push(label.to_string());
        Ok(HostBuffer::zeroed(len, element_size, label))
    }

    fn clear_buffer(&self, buffer: &HostBuffer) -> Result<(), BackendError> {
        self.state.events.lock().push(HostEvent::Clear {
            label: buffer.label().to_string(),
        });
        buffer.clear();
        Ok(())
    }

    fn launch(
        &self,
        kernel: &HostKernel,
        args: &[KernelArg<'_, HostBuffer>],
        config: LaunchConfig,
    ) -> Result<(), BackendError> {
        let group_size = self.validate_launch(kernel, args, &config)?;
        self.state.events.lock().push(HostEvent::Launch {
            kernel: kernel.name.clone(),
            config,
        });
        if self.state.failing.read().contains(&kernel.name) {
            return Err(BackendError::GpuExecution(format!(
                "kernel '{}' faulted",
                kernel.name
            )));
        }
        trace!(
            kernel = %kernel.name,
            total_threads = config.total_threads,
            group_size,
            shared_memory_bytes = config.shared_memory_bytes,
            "host launch"
        );
        kernels::execute(kernel, args, &config, group_size)
    }
}
