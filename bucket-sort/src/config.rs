//! Strategy selection and launch sizing.
//!
//! [`SortConfiguration::derive`] is a pure function of the array length, the
//! record layout and the device limits. Nothing here touches a device, so
//! every sizing rule can be tested directly.

use sort_runtime::{DeviceLimits, LaunchConfig};

/// Bytes per bucket counter in the positions kernel's shared scan buffer.
const COUNTER_SIZE: usize = 4;

/// Launch parameters derived once per sorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfiguration {
    pub length: usize,
    pub data_size: usize,
    pub key_size: usize,
    /// Records that fit in half a group's shared memory.
    pub max_local_capacity: usize,
    /// Whole array sorted by one kernel in shared memory.
    pub is_short_list: bool,
    pub range_group_size: usize,
    pub positions_group_size: usize,
    pub sort_group_size: usize,
    /// Expected records per bucket; 0 on the short-list path.
    pub target_bucket_size: usize,
    /// 0 on the short-list path, at least 1 otherwise.
    pub num_buckets: usize,
}

impl SortConfiguration {
    /// Size both strategies for `length` records of `data_size` bytes and pick one.
    ///
    /// Any bound that would leave a group size off a power of two rounds down
    /// to the power of two below it. Group sizes are never 0, so `limits`
    /// must report at least one thread per group; backends report a zero
    /// limit as unavailable.
    pub fn derive(length: usize, data_size: usize, key_size: usize, limits: DeviceLimits) -> Self {
        let max_local_capacity = limits.max_shared_memory_per_group / data_size.max(1) / 2;
        let is_short_list = length <= max_local_capacity;

        let max_group = prev_power_of_two(limits.max_threads_per_group);
        let shared = limits.max_shared_memory_per_group;
        // The one-group reductions keep one key (or counter) per thread in shared memory.
        let mut range_group_size = max_group.min(prev_power_of_two(shared / key_size.max(1)));
        let mut positions_group_size = max_group.min(prev_power_of_two(shared / COUNTER_SIZE));
        let mut sort_group_size = if is_short_list {
            max_group / 2
        } else {
            max_group / 4
        }
        .max(1);
        if sort_group_size > max_local_capacity {
            sort_group_size = prev_power_of_two(max_local_capacity);
        }

        let mut target_bucket_size = 0;
        let mut num_buckets = 0;
        if !is_short_list {
            target_bucket_size = (sort_group_size / 2).max(1);
            num_buckets = (length / target_bucket_size).max(1);
            if length < range_group_size {
                range_group_size = prev_power_of_two(length);
            }
            if num_buckets < positions_group_size {
                positions_group_size = prev_power_of_two(num_buckets);
            }
        }

        Self {
            length,
            data_size,
            key_size,
            max_local_capacity,
            is_short_list,
            range_group_size,
            positions_group_size,
            sort_group_size,
            target_bucket_size,
            num_buckets,
        }
    }

    /// One group of `sort_group_size` threads holding the whole array in shared memory.
    pub fn short_list_launch(&self) -> LaunchConfig {
        LaunchConfig::groups(
            self.sort_group_size,
            self.sort_group_size,
            self.length * self.data_size,
        )
    }

    /// One group reducing the key range.
    pub fn range_launch(&self) -> LaunchConfig {
        LaunchConfig::groups(
            self.range_group_size,
            self.range_group_size,
            self.range_group_size * self.key_size,
        )
    }

    pub fn assign_launch(&self) -> LaunchConfig {
        LaunchConfig::grid(self.length)
    }

    /// One group scanning the bucket counters.
    pub fn positions_launch(&self) -> LaunchConfig {
        LaunchConfig::groups(
            self.positions_group_size,
            self.positions_group_size,
            self.positions_group_size * COUNTER_SIZE,
        )
    }

    pub fn scatter_launch(&self) -> LaunchConfig {
        LaunchConfig::grid(self.length)
    }

    /// One group per `sort_group_size` records, each with a full group of records in shared memory.
    ///
    /// Buckets are sized by key value, not by count, so a skewed input can put
    /// more than `sort_group_size` records in one bucket. The grant is never
    /// reduced below a full group; oversized buckets are the kernel's concern.
    pub fn sort_buckets_launch(&self) -> LaunchConfig {
        LaunchConfig::groups(
            self.length.div_ceil(self.sort_group_size) * self.sort_group_size,
            self.sort_group_size,
            self.sort_group_size * self.data_size,
        )
    }
}

/// Largest power of two not exceeding `n`, and 1 for `n == 0`.
pub(crate) fn prev_power_of_two(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}
