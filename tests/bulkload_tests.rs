//! Bulk-load construction tests.
//!
//! Bulk equivalence: a bulk-loaded tree must be observably identical to a
//! tree built by individual inserts, through point reads, scans, and the
//! per-level statistics shape.

#![allow(clippy::unwrap_used)]

mod common;

use bptree::{BPlusTreeFixLen, BPlusTreeVarLen};
use common::{closed, decode, key};

fn entries(n: u64) -> Vec<([u8; 8], u64)> {
    (1..=n).map(|i| (key(i), i * 2)).collect()
}

fn scan_all(tree: &BPlusTreeVarLen<u64>) -> Vec<(u64, u64)> {
    let mut iter = tree.scan(None, None);
    let mut out = Vec::new();
    while iter.has_next() {
        let (k, v) = iter.get();
        out.push((decode(k), v));
        iter.advance();
    }
    out
}

#[test]
fn bulkload_single_thread_equivalence() {
    let bulk: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    let incremental: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);

    let input = entries(20_000);
    bulk.bulkload(&input, 1);
    for (k, v) in &input {
        incremental.insert(k, *v).unwrap();
    }

    assert_eq!(scan_all(&bulk), scan_all(&incremental));
    for (k, v) in &input {
        assert_eq!(bulk.read(k), Some(*v));
    }
    assert_eq!(bulk.read(&key(0)), None);
    assert_eq!(bulk.read(&key(20_001)), None);
}

#[test]
fn bulkload_four_threads_large() {
    let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    let input = entries(100_000);
    tree.bulkload(&input, 4);

    assert_eq!(tree.read(&key(50_000)), Some(100_000));
    assert_eq!(tree.read(&key(1)), Some(2));
    assert_eq!(tree.read(&key(100_000)), Some(200_000));

    // Leaves on exactly one level, inner nodes above.
    let stats = tree.collect_statistics();
    assert!(stats.len() >= 2, "100k records need inner levels");
    assert_eq!(stats[0].node_count, 1, "exactly one root");
    for window in stats.windows(2) {
        assert!(
            window[0].node_count <= window[1].node_count,
            "levels grow toward the leaves"
        );
    }

    // A bounded scan crossing many partial-tree borders stays ordered.
    let lo = key(25_000);
    let hi = key(75_000);
    let mut iter = tree.scan(Some(closed(&lo)), Some(closed(&hi)));
    let mut expected = 25_000u64;
    while iter.has_next() {
        let (k, v) = iter.get();
        assert_eq!(decode(k), expected);
        assert_eq!(v, expected * 2);
        expected += 1;
        iter.advance();
    }
    assert_eq!(expected, 75_001);
}

#[test]
fn bulkload_thread_counts_agree() {
    let input = entries(30_000);
    let reference: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    reference.bulkload(&input, 1);
    let reference_scan = scan_all(&reference);

    for threads in [2, 3, 4, 8] {
        let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        tree.bulkload(&input, threads);
        assert_eq!(
            scan_all(&tree),
            reference_scan,
            "bulkload with {threads} threads diverged"
        );
    }
}

#[test]
fn bulkload_replaces_previous_contents() {
    let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    tree.write(b"stale", 1);
    tree.write(&key(999), 2);

    let input = entries(1_000);
    tree.bulkload(&input, 1);

    assert_eq!(tree.read(b"stale"), None);
    assert_eq!(tree.read(&key(999)), Some(1_998));
    assert_eq!(scan_all(&tree).len(), 1_000);
}

#[test]
fn bulkload_then_incremental_operations() {
    let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    tree.bulkload(&entries(10_000), 2);

    // The free-space reserve must absorb fresh inserts without trouble.
    for i in 10_001..=10_500u64 {
        tree.insert(&key(i), i * 2).unwrap();
    }
    for i in (1..=10_000u64).step_by(2) {
        tree.delete(&key(i)).unwrap();
    }
    tree.write(&key(2), 42);

    assert_eq!(tree.read(&key(1)), None);
    assert_eq!(tree.read(&key(2)), Some(42));
    assert_eq!(tree.read(&key(10_250)), Some(20_500));

    let all = scan_all(&tree);
    assert_eq!(all.len(), 5_000 + 500);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn bulkload_variable_length_keys() {
    let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
    // Mixed-length keys in lexicographic order.
    let input: Vec<(Vec<u8>, u64)> = (0u64..5_000)
        .map(|i| {
            let mut k = key(i).to_vec();
            k.extend(std::iter::repeat_n(b'x', (i % 40) as usize));
            (k, i)
        })
        .collect();
    let mut sorted = input.clone();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    tree.bulkload(&sorted, 3);

    for (k, v) in &input {
        assert_eq!(tree.read(k), Some(*v), "key {k:?}");
    }
}

#[test]
fn bulkload_fixlen_layout() {
    let tree: BPlusTreeFixLen<u64> = BPlusTreeFixLen::new(1_000, 0);
    let input = entries(50_000);
    tree.bulkload(&input, 4);

    assert_eq!(tree.read(&key(25_000)), Some(50_000));
    for i in (1..=50_000u64).step_by(997) {
        assert_eq!(tree.read(&key(i)), Some(i * 2));
    }

    let mut iter = tree.scan(None, None);
    let mut count = 0u64;
    while iter.has_next() {
        count += 1;
        iter.advance();
    }
    assert_eq!(count, 50_000);
}

#[test]
fn bulkload_tiny_inputs() {
    for n in [1u64, 2, 3, 10] {
        let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        tree.bulkload(&entries(n), 4);
        for i in 1..=n {
            assert_eq!(tree.read(&key(i)), Some(i * 2));
        }
        assert_eq!(scan_all(&tree).len(), n as usize);
    }
}
