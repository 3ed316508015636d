//! Host implementations of the sort kernel library.
//!
//! Each function reproduces the observable effect of one device kernel on its
//! buffers, using the same positional argument list. Records are ordered by
//! their full-width [`HostKey`]. The key range is stored in the range buffer
//! as f32 (4-byte keys) or f64 (8-byte keys) and only places keys in buckets;
//! that mapping is monotone in the key, so its rounding never misorders output.

use rayon::prelude::*;

use super::buffer::{read_u32, write_u32, HostBuffer};
use super::{HostKernel, HostKey, KeyFn};
use crate::backend::{KernelArg, LaunchConfig};
use crate::buffer::DeviceBuffer;
use crate::error::BackendError;

/// The kernels the host backend knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostOp {
    ShortList,
    ComputeRange,
    AssignToBuckets,
    BucketPositions,
    CopyToBuckets,
    SortBuckets,
}

impl HostOp {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "sortShortList" => Some(HostOp::ShortList),
            "computeRange" => Some(HostOp::ComputeRange),
            "assignElementsToBuckets" => Some(HostOp::AssignToBuckets),
            "computeBucketPositions" => Some(HostOp::BucketPositions),
            "copyDataToBuckets" => Some(HostOp::CopyToBuckets),
            "sortBuckets" => Some(HostOp::SortBuckets),
            _ => None,
        }
    }
}

/// Positional argument accessor with kernel-named errors.
struct Args<'k, 'a> {
    kernel: &'k str,
    args: &'k [KernelArg<'a, HostBuffer>],
}

impl<'k, 'a> Args<'k, 'a> {
    fn expect_arity(&self, n: usize) -> Result<(), BackendError> {
        if self.args.len() != n {
            return Err(BackendError::invalid_launch(
                self.kernel,
                format!("expected {} arguments, got {}", n, self.args.len()),
            ));
        }
        Ok(())
    }

    fn buffer(&self, index: usize) -> Result<&'a HostBuffer, BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buf)) => Ok(*buf),
            _ => Err(BackendError::invalid_launch(
                self.kernel,
                format!("argument {} must be a buffer", index),
            )),
        }
    }

    /// A buffer argument holding at least `min_len` u32 words.
    fn words(&self, index: usize, min_len: usize) -> Result<&'a HostBuffer, BackendError> {
        let buf = self.buffer(index)?;
        if buf.element_size() != 4 || buf.len() < min_len {
            return Err(BackendError::invalid_launch(
                self.kernel,
                format!(
                    "argument {} ('{}') must hold at least {} u32 values",
                    index,
                    buf.label(),
                    min_len
                ),
            ));
        }
        Ok(buf)
    }

    fn u32(&self, index: usize) -> Result<u32, BackendError> {
        match self.args.get(index) {
            Some(KernelArg::U32(v)) => Ok(*v),
            _ => Err(BackendError::invalid_launch(
                self.kernel,
                format!("argument {} must be a u32 scalar", index),
            )),
        }
    }

    /// The record array argument, checked to hold `length` records the key can be read from.
    fn records(
        &self,
        index: usize,
        length: usize,
        key_width: usize,
    ) -> Result<&'a HostBuffer, BackendError> {
        let buf = self.buffer(index)?;
        if buf.len() < length {
            return Err(BackendError::invalid_launch(
                self.kernel,
                format!("length {} exceeds buffer '{}' of {}", length, buf.label(), buf.len()),
            ));
        }
        if buf.element_size() < key_width {
            return Err(BackendError::invalid_launch(
                self.kernel,
                format!(
                    "record size {} is smaller than the {}-byte key",
                    buf.element_size(),
                    key_width
                ),
            ));
        }
        Ok(buf)
    }
}

pub(crate) fn execute(
    kernel: &HostKernel,
    args: &[KernelArg<'_, HostBuffer>],
    config: &LaunchConfig,
    group_size: usize,
) -> Result<(), BackendError> {
    let args = Args {
        kernel: &kernel.name,
        args,
    };
    match kernel.op {
        HostOp::ShortList => sort_short_list(kernel, &args, config),
        HostOp::ComputeRange => compute_range(kernel, &args),
        HostOp::AssignToBuckets => assign_elements_to_buckets(kernel, &args),
        HostOp::BucketPositions => compute_bucket_positions(&args),
        HostOp::CopyToBuckets => copy_data_to_buckets(&args),
        HostOp::SortBuckets => sort_buckets(kernel, &args, config, group_size),
    }
}

/// `sortShortList(data, length)`: the whole array sorted inside one group's shared memory.
fn sort_short_list(
    kernel: &HostKernel,
    args: &Args<'_, '_>,
    config: &LaunchConfig,
) -> Result<(), BackendError> {
    args.expect_arity(2)?;
    let length = args.u32(1)? as usize;
    let data = args.records(0, length, kernel.layout.key_width)?;
    let stride = data.element_size();
    let needed = length * stride;
    if config.shared_memory_bytes < needed {
        return Err(BackendError::invalid_launch(
            &kernel.name,
            format!(
                "shared memory grant of {} bytes cannot hold {} records ({} bytes)",
                config.shared_memory_bytes, length, needed
            ),
        ));
    }

    let mut bytes = data.lock();
    let sorted = sorted_records(&bytes[..needed], stride, &kernel.layout.key);
    bytes[..needed].copy_from_slice(&sorted);
    Ok(())
}

/// `computeRange(data, length, range)`: writes `[min_key, max_key]`.
fn compute_range(kernel: &HostKernel, args: &Args<'_, '_>) -> Result<(), BackendError> {
    args.expect_arity(3)?;
    let length = args.u32(1)? as usize;
    let data = args.records(0, length, kernel.layout.key_width)?;
    let range = args.buffer(2)?;
    check_range_buffer(args.kernel, range)?;

    let stride = data.element_size();
    let bytes = data.lock();
    let bounds = bytes[..length * stride]
        .chunks_exact(stride)
        .map(|record| (kernel.layout.key)(record))
        .fold(None, |acc: Option<(HostKey, HostKey)>, key| match acc {
            None => Some((key, key)),
            Some((lo, hi)) => Some((lo.min(key), hi.max(key))),
        });
    drop(bytes);

    let (minimum, maximum) = bounds.map_or((0.0, 0.0), |(lo, hi)| (lo.to_f64(), hi.to_f64()));
    write_range(range, minimum, maximum);
    Ok(())
}

/// `assignElementsToBuckets(data, length, numBuckets, range, bucketOffset, bucketOfElement, offsetInBucket)`.
///
/// Buckets are equal-width intervals of the key range. Counters are bumped in
/// element order, which is one of the orders the device's atomics may produce.
fn assign_elements_to_buckets(
    kernel: &HostKernel,
    args: &Args<'_, '_>,
) -> Result<(), BackendError> {
    args.expect_arity(7)?;
    let length = args.u32(1)? as usize;
    let num_buckets = args.u32(2)? as usize;
    if num_buckets == 0 {
        return Err(BackendError::invalid_launch(args.kernel, "numBuckets is zero"));
    }
    let data = args.records(0, length, kernel.layout.key_width)?;
    let range = args.buffer(3)?;
    check_range_buffer(args.kernel, range)?;
    let bucket_offset = args.words(4, num_buckets)?;
    let bucket_of_element = args.words(5, length)?;
    let offset_in_bucket = args.words(6, length)?;

    let (minimum, maximum) = read_range(range);
    let width = (maximum - minimum) / num_buckets as f64;

    let stride = data.element_size();
    let records = data.lock();
    let mut counts = bucket_offset.lock();
    let mut buckets = bucket_of_element.lock();
    let mut offsets = offset_in_bucket.lock();
    for (i, record) in records[..length * stride].chunks_exact(stride).enumerate() {
        let key = (kernel.layout.key)(record);
        let bucket = bucket_index(key.to_f64(), minimum, width, num_buckets);
        let count = read_u32(&counts, bucket);
        write_u32(&mut counts, bucket, count + 1);
        write_u32(&mut offsets, i, count);
        write_u32(&mut buckets, i, bucket as u32);
    }
    Ok(())
}

/// Interval index of `key`, clamped into `[0, num_buckets)`. A zero-width
/// range (all keys equal) maps everything to bucket 0.
pub(crate) fn bucket_index(key: f64, minimum: f64, width: f64, num_buckets: usize) -> usize {
    if !(width > 0.0) {
        return 0;
    }
    // `as` saturates: NaN and negatives become 0.
    (((key - minimum) / width) as usize).min(num_buckets - 1)
}

/// `computeBucketPositions(numBuckets, bucketOffset)`: counts become exclusive start offsets.
fn compute_bucket_positions(args: &Args<'_, '_>) -> Result<(), BackendError> {
    args.expect_arity(2)?;
    let num_buckets = args.u32(0)? as usize;
    let bucket_offset = args.words(1, num_buckets)?;

    let mut offsets = bucket_offset.lock();
    let mut running = 0u32;
    for b in 0..num_buckets {
        let count = read_u32(&offsets, b);
        write_u32(&mut offsets, b, running);
        running = running.wrapping_add(count);
    }
    Ok(())
}

/// `copyDataToBuckets(data, buckets, length, bucketOffset, bucketOfElement, offsetInBucket)`.
fn copy_data_to_buckets(args: &Args<'_, '_>) -> Result<(), BackendError> {
    args.expect_arity(6)?;
    let length = args.u32(2)? as usize;
    let data = args.records(0, length, 0)?;
    let scratch = args.records(1, length, 0)?;
    if scratch.element_size() != data.element_size() {
        return Err(BackendError::invalid_launch(
            args.kernel,
            "bucket scratch and data record sizes differ",
        ));
    }
    let bucket_offset = args.buffer(3)?;
    let bucket_of_element = args.words(4, length)?;
    let offset_in_bucket = args.words(5, length)?;

    let stride = data.element_size();
    let src = data.lock();
    let mut dst = scratch.lock();
    let starts = bucket_offset.lock();
    let buckets = bucket_of_element.lock();
    let offsets = offset_in_bucket.lock();
    let num_starts = starts.len() / 4;
    for i in 0..length {
        let bucket = read_u32(&buckets, i) as usize;
        if bucket >= num_starts {
            return Err(BackendError::GpuExecution(format!(
                "{}: bucket {} of element {} out of range",
                args.kernel, bucket, i
            )));
        }
        let target = read_u32(&starts, bucket) as usize + read_u32(&offsets, i) as usize;
        if target >= length {
            return Err(BackendError::GpuExecution(format!(
                "{}: element {} scattered to {} past length {}",
                args.kernel, i, target, length
            )));
        }
        dst[target * stride..(target + 1) * stride]
            .copy_from_slice(&src[i * stride..(i + 1) * stride]);
    }
    Ok(())
}

/// `sortBuckets(data, buckets, length, numBuckets, bucketOffset)`: every bucket's
/// slice of the scratch array is sorted and written to the same positions in `data`.
fn sort_buckets(
    kernel: &HostKernel,
    args: &Args<'_, '_>,
    config: &LaunchConfig,
    group_size: usize,
) -> Result<(), BackendError> {
    args.expect_arity(5)?;
    let length = args.u32(2)? as usize;
    let num_buckets = args.u32(3)? as usize;
    let data = args.records(0, length, kernel.layout.key_width)?;
    let scratch = args.records(1, length, kernel.layout.key_width)?;
    let bucket_offset = args.words(4, num_buckets)?;
    let stride = data.element_size();
    if scratch.element_size() != stride {
        return Err(BackendError::invalid_launch(
            args.kernel,
            "bucket scratch and data record sizes differ",
        ));
    }
    let needed = group_size * stride;
    if config.shared_memory_bytes < needed {
        return Err(BackendError::invalid_launch(
            args.kernel,
            format!(
                "shared memory grant of {} bytes is below {} threads x {} bytes",
                config.shared_memory_bytes, group_size, stride
            ),
        ));
    }

    let bounds = {
        let starts = bucket_offset.lock();
        let mut bounds = Vec::with_capacity(num_buckets);
        for b in 0..num_buckets {
            let start = read_u32(&starts, b) as usize;
            let end = if b + 1 < num_buckets {
                read_u32(&starts, b + 1) as usize
            } else {
                length
            };
            if start > end || end > length {
                return Err(BackendError::GpuExecution(format!(
                    "{}: bucket {} spans {}..{} outside 0..{}",
                    args.kernel, b, start, end, length
                )));
            }
            bounds.push((start, end));
        }
        bounds
    };
    if bounds.first().map_or(length > 0, |&(start, _)| start != 0) {
        return Err(BackendError::GpuExecution(format!(
            "{}: buckets do not start at offset 0",
            args.kernel
        )));
    }

    let src = scratch.lock();
    let mut dst = data.lock();
    let mut slices: Vec<&mut [u8]> = Vec::with_capacity(bounds.len());
    let mut rest: &mut [u8] = &mut dst[..length * stride];
    for &(start, end) in &bounds {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut((end - start) * stride);
        slices.push(head);
        rest = tail;
    }

    let src: &[u8] = &src[..];
    let key = &kernel.layout.key;
    slices
        .into_par_iter()
        .zip(bounds.par_iter())
        .for_each(|(out, &(start, end))| {
            let sorted = sorted_records(&src[start * stride..end * stride], stride, key);
            out.copy_from_slice(&sorted);
        });
    Ok(())
}

/// Records of `src` reordered ascending by key. Unstable, like the device's bitonic sort.
fn sorted_records(src: &[u8], stride: usize, key: &KeyFn) -> Vec<u8> {
    let mut order: Vec<(HostKey, usize)> = src
        .chunks_exact(stride)
        .enumerate()
        .map(|(i, record)| (key(record), i))
        .collect();
    order.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(src.len());
    for (_, i) in order {
        out.extend_from_slice(&src[i * stride..(i + 1) * stride]);
    }
    out
}

fn check_range_buffer(kernel: &str, range: &HostBuffer) -> Result<(), BackendError> {
    if range.len() < 2 || !matches!(range.element_size(), 4 | 8) {
        return Err(BackendError::invalid_launch(
            kernel,
            format!(
                "key range buffer '{}' must hold two 4- or 8-byte keys",
                range.label()
            ),
        ));
    }
    Ok(())
}

fn write_range(range: &HostBuffer, minimum: f64, maximum: f64) {
    let mut bytes = range.lock();
    if range.element_size() == 4 {
        bytes[0..4].copy_from_slice(&(minimum as f32).to_le_bytes());
        bytes[4..8].copy_from_slice(&(maximum as f32).to_le_bytes());
    } else {
        bytes[0..8].copy_from_slice(&minimum.to_le_bytes());
        bytes[8..16].copy_from_slice(&maximum.to_le_bytes());
    }
}

fn read_range(range: &HostBuffer) -> (f64, f64) {
    let bytes = range.lock();
    if range.element_size() == 4 {
        let lo: f32 = bytemuck::pod_read_unaligned(&bytes[0..4]);
        let hi: f32 = bytemuck::pod_read_unaligned(&bytes[4..8]);
        (lo as f64, hi as f64)
    } else {
        let lo: f64 = bytemuck::pod_read_unaligned(&bytes[0..8]);
        let hi: f64 = bytemuck::pod_read_unaligned(&bytes[8..16]);
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_clamps() {
        assert_eq!(bucket_index(0.0, 0.0, 10.0, 4), 0);
        assert_eq!(bucket_index(25.0, 0.0, 10.0, 4), 2);
        assert_eq!(bucket_index(40.0, 0.0, 10.0, 4), 3);
        assert_eq!(bucket_index(1e30, 0.0, 10.0, 4), 3);
        assert_eq!(bucket_index(-5.0, 0.0, 10.0, 4), 0);
        assert_eq!(bucket_index(f64::NAN, 0.0, 10.0, 4), 0);
    }

    #[test]
    fn test_bucket_index_zero_width() {
        assert_eq!(bucket_index(7.0, 7.0, 0.0, 16), 0);
    }

    #[test]
    fn test_bucket_index_is_monotone() {
        let mut last = 0;
        for i in 0..1000 {
            let b = bucket_index(i as f64 * 0.37, 3.0, 12.5, 20);
            assert!(b >= last);
            last = b;
        }
    }

    #[test]
    fn test_sorted_records_keeps_64_bit_keys_distinct() {
        let key: KeyFn = std::sync::Arc::new(|r: &[u8]| -> HostKey {
            HostKey::from(bytemuck::pod_read_unaligned::<u64>(r))
        });
        let base = 1u64 << 60;
        let values = [base + 1, base, u64::MAX, base + 2];
        let sorted = sorted_records(bytemuck::cast_slice(&values[..]), 8, &key);
        let sorted: Vec<u64> = bytemuck::pod_collect_to_vec(&sorted[..]);
        assert_eq!(sorted, vec![base, base + 1, base + 2, u64::MAX]);
    }

    #[test]
    fn test_host_key_order() {
        assert!(HostKey::from(i64::MIN) < HostKey::from(i64::MIN + 1));
        assert!(HostKey::from((1u64 << 53) + 1) > HostKey::from(1u64 << 53));
        assert!(HostKey::from(-0.0f32) < HostKey::from(0.0f32));
        assert_eq!(HostKey::from(7u32), HostKey::Unsigned(7));
    }

    #[test]
    fn test_op_from_name() {
        assert_eq!(HostOp::from_name("sortBuckets"), Some(HostOp::SortBuckets));
        assert_eq!(HostOp::from_name("bitonicMerge"), None);
    }

    #[test]
    fn test_range_round_trip_f64() {
        let range = HostBuffer::zeroed(2, 8, "range");
        write_range(&range, -3.5, 1e12);
        assert_eq!(read_range(&range), (-3.5, 1e12));
    }
}
