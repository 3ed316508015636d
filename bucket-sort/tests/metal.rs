//! End-to-end sorts on the system Metal device.
#![cfg(target_os = "macos")]

mod common;

use bucket_sort::{BucketSorter, RecordDescriptor, KERNEL_SOURCE};
use common::{is_sorted_by_key, random_pairs, seeded_rng, verify_pairs_preserved, KeyedPair};
use rand::Rng;
use sort_runtime::{BackendError, DeviceBackend, DeviceLimit, KernelArg, LaunchConfig, MetalBackend};

fn metal_sort_pairs(data: &[KeyedPair]) -> Vec<KeyedPair> {
    let backend = MetalBackend::new().expect("no Metal device");
    let buf = backend.buffer_from_slice(data, "data").unwrap();
    let mut sorter = BucketSorter::new(backend, RecordDescriptor::keyed_u32_pair(), data.len()).unwrap();
    sorter.sort(&buf).unwrap();
    buf.download::<KeyedPair>()
}

#[test]
fn test_metal_limits_reported() {
    let backend = MetalBackend::new().expect("no Metal device");
    assert!(backend.device_limit(DeviceLimit::MaxThreadsPerGroup).unwrap() >= 256);
    assert!(backend.device_limit(DeviceLimit::MaxSharedMemoryPerGroup).unwrap() >= 16_384);
}

#[test]
fn test_metal_rejects_excess_shared_memory() {
    let backend = MetalBackend::new().expect("no Metal device");
    let shared = backend.device_limit(DeviceLimit::MaxSharedMemoryPerGroup).unwrap();
    let kernel = backend
        .compile_library(KERNEL_SOURCE, &RecordDescriptor::scalar_u32().substitutions())
        .unwrap()
        .take("sortShortList")
        .unwrap();
    let buf = backend.buffer_from_slice(&[2u32, 1], "data").unwrap();
    let err = backend
        .launch(
            &kernel,
            &[KernelArg::Buffer(&buf), KernelArg::U32(2)],
            LaunchConfig::groups(2, 2, shared + 16),
        )
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidLaunch { .. }));
    assert_eq!(buf.download::<u32>(), vec![2, 1]);
}

#[test]
fn test_metal_short_list() {
    let data = random_pairs(&mut seeded_rng(1), 1500, u32::MAX);
    let sorted = metal_sort_pairs(&data);
    assert!(is_sorted_by_key(&sorted));
    assert!(verify_pairs_preserved(&data, &sorted));
}

#[test]
fn test_metal_bucket_pipeline() {
    for n in [5_000, 100_000, 1_000_000] {
        let data = random_pairs(&mut seeded_rng(n as u64), n, u32::MAX);
        let sorted = metal_sort_pairs(&data);
        assert!(is_sorted_by_key(&sorted), "n={}", n);
        assert!(verify_pairs_preserved(&data, &sorted), "n={}", n);
    }
}

#[test]
fn test_metal_skewed_buckets() {
    let mut rng = seeded_rng(7);
    let mut data: Vec<KeyedPair> = (0..50_000)
        .map(|i| KeyedPair {
            key: rng.gen_range(0..100),
            payload: i,
        })
        .collect();
    data[0].key = u32::MAX;
    let sorted = metal_sort_pairs(&data);
    assert!(is_sorted_by_key(&sorted));
    assert!(verify_pairs_preserved(&data, &sorted));
}

#[test]
fn test_metal_f32_scalars() {
    let backend = MetalBackend::new().expect("no Metal device");
    let mut rng = seeded_rng(8);
    let data: Vec<f32> = (0..200_000).map(|_| rng.gen::<f32>() * 100.0 - 50.0).collect();
    let buf = backend.buffer_from_slice(&data, "data").unwrap();
    let mut sorter = BucketSorter::new(backend, RecordDescriptor::scalar_f32(), data.len()).unwrap();
    sorter.sort(&buf).unwrap();

    let mut expected = data;
    expected.sort_by(f32::total_cmp);
    assert_eq!(buf.download::<f32>(), expected);
}
