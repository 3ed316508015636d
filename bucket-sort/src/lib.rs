//! Adaptive device sort for fixed-length record arrays.
//!
//! A [`BucketSorter`] is built once per (record layout, array length). At
//! construction it compiles the kernel library for the record type, reads the
//! device's group-size and shared-memory limits and picks a strategy:
//!
//! - **short list**: the whole array fits in half of one group's shared
//!   memory and is sorted by a single kernel launch;
//! - **bucket pipeline**: five launches compute the key range, assign records
//!   to equal-width key intervals, scan the bucket counts into offsets,
//!   scatter records into bucket order and sort each bucket back into place.
//!
//! Every later [`sort`](BucketSorter::sort) call reruns the chosen strategy
//! on new buffer contents, reusing the sorter's scratch buffers.

mod config;
mod descriptor;

use sort_runtime::{
    BackendError, DeviceBackend, DeviceBuffer, DeviceLimit, DeviceLimits, KernelArg,
};
use tracing::{debug, trace};

pub use config::SortConfiguration;
pub use descriptor::RecordDescriptor;

/// The Metal kernel library the sorter compiles, before substitution.
pub const KERNEL_SOURCE: &str = include_str!("../shaders/sort.metal");

const SHORT_LIST_KERNEL: &str = "sortShortList";
const RANGE_KERNEL: &str = "computeRange";
const ASSIGN_KERNEL: &str = "assignElementsToBuckets";
const POSITIONS_KERNEL: &str = "computeBucketPositions";
const SCATTER_KERNEL: &str = "copyDataToBuckets";
const SORT_BUCKETS_KERNEL: &str = "sortBuckets";

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device limit unavailable: {0}")]
    DeviceLimitUnavailable(DeviceLimit),
    #[error("device execution failed: {0}")]
    DeviceExecution(#[source] BackendError),
}

impl From<BackendError> for SortError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::LimitUnavailable(limit) => SortError::DeviceLimitUnavailable(limit),
            other => SortError::DeviceExecution(other),
        }
    }
}

struct SortKernels<K> {
    short_list: K,
    compute_range: K,
    assign: K,
    positions: K,
    scatter: K,
    sort_buckets: K,
}

/// Scratch buffers of the bucket pipeline.
struct BucketWorkspace<Buf> {
    key_range: Buf,
    bucket_offset: Buf,
    bucket_of_element: Buf,
    offset_in_bucket: Buf,
    buckets: Buf,
}

/// Sorts one fixed-length device buffer of records by key, in place.
///
/// Calls to [`sort`](Self::sort) take `&mut self`: the scratch buffers are
/// shared between calls and must not be used by two sorts at once.
pub struct BucketSorter<B: DeviceBackend> {
    backend: B,
    descriptor: RecordDescriptor,
    config: SortConfiguration,
    kernels: SortKernels<B::Kernel>,
    workspace: Option<BucketWorkspace<B::Buffer>>,
}

impl<B: DeviceBackend> BucketSorter<B> {
    /// Compile the kernels for `descriptor`, size the launches for `length`
    /// records and allocate the bucket pipeline's scratch buffers if it is used.
    pub fn new(backend: B, descriptor: RecordDescriptor, length: usize) -> Result<Self, SortError> {
        descriptor.validate()?;
        if u32::try_from(length).is_err() {
            return Err(SortError::InvalidArgument(format!(
                "length {} does not fit in a 32-bit kernel argument",
                length
            )));
        }

        let mut library = backend.compile_library(KERNEL_SOURCE, &descriptor.substitutions())?;
        let kernels = SortKernels {
            short_list: library.take(SHORT_LIST_KERNEL)?,
            compute_range: library.take(RANGE_KERNEL)?,
            assign: library.take(ASSIGN_KERNEL)?,
            positions: library.take(POSITIONS_KERNEL)?,
            scatter: library.take(SCATTER_KERNEL)?,
            sort_buckets: library.take(SORT_BUCKETS_KERNEL)?,
        };

        let limits = DeviceLimits::query(&backend)?;
        let config =
            SortConfiguration::derive(length, descriptor.data_size, descriptor.key_size, limits);
        debug!(
            length,
            data_type = %descriptor.data_type,
            short_list = config.is_short_list,
            max_local_capacity = config.max_local_capacity,
            sort_group_size = config.sort_group_size,
            num_buckets = config.num_buckets,
            "sort strategy selected"
        );

        let workspace = if config.is_short_list {
            None
        } else {
            Some(BucketWorkspace {
                key_range: backend.alloc_buffer(2, descriptor.key_size, "sortDataRange")?,
                bucket_offset: backend.alloc_buffer(config.num_buckets, 4, "bucketOffset")?,
                bucket_of_element: backend.alloc_buffer(length, 4, "bucketOfElement")?,
                offset_in_bucket: backend.alloc_buffer(length, 4, "offsetInBucket")?,
                buckets: backend.alloc_buffer(length, descriptor.data_size, "buckets")?,
            })
        };

        Ok(Self {
            backend,
            descriptor,
            config,
            kernels,
            workspace,
        })
    }

    /// Sort `data` ascending by key. Equal keys may be reordered.
    ///
    /// `data` must hold exactly [`len`](Self::len) records of the descriptor's
    /// size; otherwise nothing is launched and `InvalidArgument` is returned.
    /// After a device error the scratch buffers are undefined and the sorter
    /// should be dropped.
    pub fn sort(&mut self, data: &B::Buffer) -> Result<(), SortError> {
        if data.len() != self.config.length || data.element_size() != self.descriptor.data_size {
            return Err(SortError::InvalidArgument(format!(
                "buffer holds {} records of {} bytes, sorter expects {} of {}",
                data.len(),
                data.element_size(),
                self.config.length,
                self.descriptor.data_size
            )));
        }
        if self.config.length == 0 {
            return Ok(());
        }

        match &self.workspace {
            None => self.sort_short_list(data),
            Some(workspace) => self.sort_buckets(data, workspace),
        }
    }

    fn sort_short_list(&self, data: &B::Buffer) -> Result<(), SortError> {
        trace!(length = self.config.length, "short-list sort");
        self.backend.launch(
            &self.kernels.short_list,
            &[KernelArg::Buffer(data), KernelArg::U32(self.length_arg())],
            self.config.short_list_launch(),
        )?;
        Ok(())
    }

    fn sort_buckets(
        &self,
        data: &B::Buffer,
        ws: &BucketWorkspace<B::Buffer>,
    ) -> Result<(), SortError> {
        let config = &self.config;
        let length = self.length_arg();
        let num_buckets = config.num_buckets as u32;

        trace!(length, "bucket sort: key range");
        self.backend.launch(
            &self.kernels.compute_range,
            &[
                KernelArg::Buffer(data),
                KernelArg::U32(length),
                KernelArg::Buffer(&ws.key_range),
            ],
            config.range_launch(),
        )?;

        trace!(num_buckets, "bucket sort: assign");
        self.backend.clear_buffer(&ws.bucket_offset)?;
        self.backend.launch(
            &self.kernels.assign,
            &[
                KernelArg::Buffer(data),
                KernelArg::U32(length),
                KernelArg::U32(num_buckets),
                KernelArg::Buffer(&ws.key_range),
                KernelArg::Buffer(&ws.bucket_offset),
                KernelArg::Buffer(&ws.bucket_of_element),
                KernelArg::Buffer(&ws.offset_in_bucket),
            ],
            config.assign_launch(),
        )?;

        trace!("bucket sort: positions");
        self.backend.launch(
            &self.kernels.positions,
            &[KernelArg::U32(num_buckets), KernelArg::Buffer(&ws.bucket_offset)],
            config.positions_launch(),
        )?;

        trace!("bucket sort: scatter");
        self.backend.launch(
            &self.kernels.scatter,
            &[
                KernelArg::Buffer(data),
                KernelArg::Buffer(&ws.buckets),
                KernelArg::U32(length),
                KernelArg::Buffer(&ws.bucket_offset),
                KernelArg::Buffer(&ws.bucket_of_element),
                KernelArg::Buffer(&ws.offset_in_bucket),
            ],
            config.scatter_launch(),
        )?;

        trace!("bucket sort: per-bucket sort");
        self.backend.launch(
            &self.kernels.sort_buckets,
            &[
                KernelArg::Buffer(data),
                KernelArg::Buffer(&ws.buckets),
                KernelArg::U32(length),
                KernelArg::U32(num_buckets),
                KernelArg::Buffer(&ws.bucket_offset),
            ],
            config.sort_buckets_launch(),
        )?;
        Ok(())
    }

    /// Checked to fit at construction.
    fn length_arg(&self) -> u32 {
        self.config.length as u32
    }

    pub fn configuration(&self) -> &SortConfiguration {
        &self.config
    }

    pub fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of records every sorted buffer must hold.
    pub fn len(&self) -> usize {
        self.config.length
    }

    pub fn is_empty(&self) -> bool {
        self.config.length == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sort_runtime::HostBackend;

    #[test]
    fn test_sort_error_display() {
        let e = SortError::InvalidArgument("length 3 != 4".to_string());
        assert_eq!(e.to_string(), "invalid argument: length 3 != 4");

        let e = SortError::DeviceLimitUnavailable(DeviceLimit::MaxThreadsPerGroup);
        assert_eq!(e.to_string(), "device limit unavailable: max threads per group");

        let e = SortError::DeviceExecution(BackendError::GpuExecution("timeout".to_string()));
        assert_eq!(
            e.to_string(),
            "device execution failed: GPU execution failed: timeout"
        );
    }

    #[test]
    fn test_backend_error_routing() {
        let e: SortError = BackendError::LimitUnavailable(DeviceLimit::MaxSharedMemoryPerGroup).into();
        assert!(matches!(
            e,
            SortError::DeviceLimitUnavailable(DeviceLimit::MaxSharedMemoryPerGroup)
        ));

        let e: SortError = BackendError::KernelNotFound("sortBuckets".to_string()).into();
        assert!(matches!(e, SortError::DeviceExecution(BackendError::KernelNotFound(_))));
    }

    #[test]
    fn test_kernel_source_declares_all_kernels() {
        let names = sort_runtime::kernel_names(KERNEL_SOURCE);
        for kernel in [
            SHORT_LIST_KERNEL,
            RANGE_KERNEL,
            ASSIGN_KERNEL,
            POSITIONS_KERNEL,
            SCATTER_KERNEL,
            SORT_BUCKETS_KERNEL,
        ] {
            assert!(names.iter().any(|n| n == kernel), "missing {}", kernel);
        }
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_strategy_selection() {
        let backend = HostBackend::default();
        let short = BucketSorter::new(backend.clone(), RecordDescriptor::keyed_u32_pair(), 2000).unwrap();
        assert!(short.configuration().is_short_list);
        assert!(backend.allocations().is_empty());

        let long = BucketSorter::new(backend.clone(), RecordDescriptor::keyed_u32_pair(), 5000).unwrap();
        assert!(!long.configuration().is_short_list);
        assert_eq!(
            backend.allocations(),
            vec!["sortDataRange", "bucketOffset", "bucketOfElement", "offsetInBucket", "buckets"]
        );
        assert_eq!(long.len(), 5000);
        assert!(!long.is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_length_must_fit_u32() {
        let result = BucketSorter::new(
            HostBackend::default(),
            RecordDescriptor::scalar_u32(),
            u32::MAX as usize + 1,
        );
        assert!(matches!(result, Err(SortError::InvalidArgument(_))));
    }

    #[test]
    fn test_sort_small_u32() {
        let backend = HostBackend::default();
        let mut sorter = BucketSorter::new(backend.clone(), RecordDescriptor::scalar_u32(), 5).unwrap();
        let data = backend.buffer_from_slice(&[9u32, 3, 7, 1, 3], "data").unwrap();
        sorter.sort(&data).unwrap();
        assert_eq!(data.download::<u32>(), vec![1, 3, 3, 7, 9]);
    }
}
