#![allow(dead_code)]

use bucket_sort::{BucketSorter, RecordDescriptor};
use bytemuck::{Pod, Zeroable};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sort_runtime::{DeviceLimits, HostBackend, HostBuffer};

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Matches the MSL `uint2` record of `RecordDescriptor::keyed_u32_pair`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct KeyedPair {
    pub key: u32,
    pub payload: u32,
}

/// Keys drawn from `0..key_bound`; payload is the original index.
pub fn random_pairs(rng: &mut ChaCha8Rng, n: usize, key_bound: u32) -> Vec<KeyedPair> {
    (0..n)
        .map(|i| KeyedPair {
            key: rng.gen_range(0..key_bound),
            payload: i as u32,
        })
        .collect()
}

/// A host device with the given limits and a sorter for `n` records.
pub fn host_sorter(
    limits: DeviceLimits,
    descriptor: RecordDescriptor,
    n: usize,
) -> (HostBackend, BucketSorter<HostBackend>) {
    let backend = HostBackend::new(limits);
    let sorter = BucketSorter::new(backend.clone(), descriptor, n).unwrap();
    (backend, sorter)
}

/// Sort `pairs` with a fresh host sorter and return the result.
pub fn sort_pairs(limits: DeviceLimits, pairs: &[KeyedPair]) -> Vec<KeyedPair> {
    let (backend, mut sorter) = host_sorter(limits, RecordDescriptor::keyed_u32_pair(), pairs.len());
    let buf: HostBuffer = backend.buffer_from_slice(pairs, "data").unwrap();
    sorter.sort(&buf).unwrap();
    buf.download::<KeyedPair>()
}

pub fn is_sorted_by_key(pairs: &[KeyedPair]) -> bool {
    pairs.windows(2).all(|w| w[0].key <= w[1].key)
}

/// Same multiset of records before and after sorting.
pub fn verify_pairs_preserved(orig: &[KeyedPair], sorted: &[KeyedPair]) -> bool {
    if orig.len() != sorted.len() {
        return false;
    }
    let mut a: Vec<(u32, u32)> = orig.iter().map(|p| (p.key, p.payload)).collect();
    let mut b: Vec<(u32, u32)> = sorted.iter().map(|p| (p.key, p.payload)).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
