//! Launch-level behavior of the scheduler, observed through the host backend's event log.

mod common;

use bucket_sort::{RecordDescriptor, SortError};
use common::{host_sorter, random_pairs, seeded_rng, KeyedPair};
use sort_runtime::{DeviceLimits, HostEvent, LaunchConfig};

const DEVICE: DeviceLimits = DeviceLimits::CUDA_DEFAULT;

fn launch(kernel: &str, config: LaunchConfig) -> HostEvent {
    HostEvent::Launch {
        kernel: kernel.to_string(),
        config,
    }
}

#[test]
fn test_length_mismatch_issues_no_launch() {
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), 5000);
    let data = random_pairs(&mut seeded_rng(1), 4999, 100);
    let buf = backend.buffer_from_slice(&data, "short").unwrap();

    let err = sorter.sort(&buf).unwrap_err();
    assert!(matches!(err, SortError::InvalidArgument(_)));
    assert!(backend.events().is_empty());
}

#[test]
fn test_element_size_mismatch_issues_no_launch() {
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), 100);
    let buf = backend.buffer_from_slice(&[7u32; 100], "narrow").unwrap();

    let err = sorter.sort(&buf).unwrap_err();
    assert!(matches!(err, SortError::InvalidArgument(msg) if msg.contains("4 bytes")));
    assert_eq!(backend.launch_count(), 0);
}

#[test]
fn test_empty_sorter_rejects_nonempty_buffer() {
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), 0);
    let buf = backend
        .buffer_from_slice(&[KeyedPair { key: 1, payload: 1 }], "one")
        .unwrap();
    assert!(matches!(sorter.sort(&buf), Err(SortError::InvalidArgument(_))));
    assert_eq!(backend.launch_count(), 0);
}

#[test]
fn test_short_list_is_one_launch() {
    let n = 2000;
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), n);
    assert!(backend.allocations().is_empty());

    let buf = backend
        .buffer_from_slice(&random_pairs(&mut seeded_rng(2), n, u32::MAX), "data")
        .unwrap();
    sorter.sort(&buf).unwrap();

    assert_eq!(
        backend.events(),
        vec![launch("sortShortList", LaunchConfig::groups(512, 512, 16_000))]
    );
    assert_eq!(backend.allocations(), vec!["data"]);
}

#[test]
fn test_bucket_pipeline_order_and_shapes() {
    let n = 1_000_000;
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), n);
    assert_eq!(
        backend.allocations(),
        vec!["sortDataRange", "bucketOffset", "bucketOfElement", "offsetInBucket", "buckets"]
    );

    let buf = backend
        .buffer_from_slice(&random_pairs(&mut seeded_rng(3), n, u32::MAX), "data")
        .unwrap();
    sorter.sort(&buf).unwrap();

    let expected = vec![
        launch("computeRange", LaunchConfig::groups(1024, 1024, 4096)),
        HostEvent::Clear {
            label: "bucketOffset".to_string(),
        },
        launch("assignElementsToBuckets", LaunchConfig::grid(n)),
        launch("computeBucketPositions", LaunchConfig::groups(1024, 1024, 4096)),
        launch("copyDataToBuckets", LaunchConfig::grid(n)),
        launch("sortBuckets", LaunchConfig::groups(1_000_192, 256, 2048)),
    ];
    assert_eq!(backend.events(), expected);

    // A second sort replays the same sequence and allocates nothing new.
    backend.reset_events();
    sorter.sort(&buf).unwrap();
    assert_eq!(backend.events(), expected);
    assert_eq!(backend.allocations().len(), 6);
}

#[test]
fn test_small_bucket_pipeline_shapes() {
    let n = 10_000;
    let (backend, mut sorter) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), n);
    let config = *sorter.configuration();
    assert_eq!(config.num_buckets, 78);
    assert_eq!(config.positions_group_size, 64);

    let buf = backend
        .buffer_from_slice(&random_pairs(&mut seeded_rng(4), n, 1000), "data")
        .unwrap();
    sorter.sort(&buf).unwrap();

    let launches = backend.launches();
    let kernels: Vec<&str> = launches.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        kernels,
        vec![
            "computeRange",
            "assignElementsToBuckets",
            "computeBucketPositions",
            "copyDataToBuckets",
            "sortBuckets",
        ]
    );
    assert_eq!(launches[2].1, LaunchConfig::groups(64, 64, 256));
    assert_eq!(launches[4].1, LaunchConfig::groups(10_240, 256, 2048));
}

#[test]
fn test_identical_parameters_choose_identical_strategy() {
    for n in [0, 1, 3072, 3073, 500_000] {
        let (_, a) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), n);
        let (_, b) = host_sorter(DEVICE, RecordDescriptor::keyed_u32_pair(), n);
        assert_eq!(a.configuration(), b.configuration());
    }
}
