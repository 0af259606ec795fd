//! Property-based tests for the tree.
//!
//! Differential testing against `BTreeMap` as an oracle: any sequence of
//! point operations must leave the tree observably identical to the map,
//! through point reads and through full scans.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::collections::BTreeMap;

use bptree::{BPlusTreeFixLen, BPlusTreeVarLen};
use common::{closed, key, open};
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

/// Variable-length keys, biased short so nodes fill and split.
fn varlen_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=24)
}

/// A point operation.
#[derive(Debug, Clone)]
enum Op {
    Insert(Vec<u8>, u64),
    Write(Vec<u8>, u64),
    Update(Vec<u8>, u64),
    Delete(Vec<u8>),
    Read(Vec<u8>),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (varlen_key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            3 => (varlen_key(), any::<u64>()).prop_map(|(k, v)| Op::Write(k, v)),
            1 => (varlen_key(), any::<u64>()).prop_map(|(k, v)| Op::Update(k, v)),
            2 => varlen_key().prop_map(Op::Delete),
            2 => varlen_key().prop_map(Op::Read),
        ],
        0..=max_ops,
    )
}

/// Drain a full scan into a vector.
fn scan_all(tree: &BPlusTreeVarLen<u64>) -> Vec<(Vec<u8>, u64)> {
    let mut iter = tree.scan(None, None);
    let mut out = Vec::new();
    while iter.has_next() {
        let (k, v) = iter.get();
        out.push((k.to_vec(), v));
        iter.advance();
    }
    out
}

// ============================================================================
//  Differential properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any op sequence leaves the tree equivalent to the oracle map.
    #[test]
    fn prop_matches_btreemap(ops in operations(400)) {
        let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Insert(k, v) => {
                    let tree_rc = tree.insert(k, *v);
                    if oracle.contains_key(k) {
                        let err = tree_rc.unwrap_err();
                        prop_assert_eq!(err.payload, oracle[k]);
                    } else {
                        prop_assert!(tree_rc.is_ok());
                        oracle.insert(k.clone(), *v);
                    }
                }
                Op::Write(k, v) => {
                    tree.write(k, *v);
                    oracle.insert(k.clone(), *v);
                }
                Op::Update(k, v) => {
                    let tree_rc = tree.update(k, *v);
                    if oracle.contains_key(k) {
                        prop_assert!(tree_rc.is_ok());
                        oracle.insert(k.clone(), *v);
                    } else {
                        prop_assert!(tree_rc.is_err());
                    }
                }
                Op::Delete(k) => {
                    let tree_rc = tree.delete(k);
                    prop_assert_eq!(tree_rc.is_ok(), oracle.remove(k).is_some());
                }
                Op::Read(k) => {
                    prop_assert_eq!(tree.read(k), oracle.get(k).copied());
                }
            }
        }

        // Full-scan equivalence: same keys, same values, ascending order.
        let scanned = scan_all(&tree);
        let expected: Vec<(Vec<u8>, u64)> =
            oracle.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(scanned, expected);

        // Point-read equivalence for every surviving key.
        for (k, v) in &oracle {
            prop_assert_eq!(tree.read(k), Some(*v));
        }
    }

    /// Bounded scans return exactly the oracle range, in order.
    #[test]
    fn prop_range_scans_match(
        entries in prop::collection::btree_map(any::<u64>(), any::<u64>(), 0..300),
        lo in any::<u64>(),
        hi in any::<u64>(),
        lo_inclusive in any::<bool>(),
        hi_inclusive in any::<bool>(),
    ) {
        let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        for (k, v) in &entries {
            tree.write(&key(*k), *v);
        }

        let lo_key = key(lo);
        let hi_key = key(hi);
        let begin = if lo_inclusive { closed(&lo_key) } else { open(&lo_key) };
        let end = if hi_inclusive { closed(&hi_key) } else { open(&hi_key) };

        let mut iter = tree.scan(Some(begin), Some(end));
        let mut scanned = Vec::new();
        while iter.has_next() {
            let (k, v) = iter.get();
            scanned.push((common::decode(k), v));
            iter.advance();
        }

        let expected: Vec<(u64, u64)> = entries
            .iter()
            .filter(|(k, _)| {
                let above = if lo_inclusive { **k >= lo } else { **k > lo };
                let below = if hi_inclusive { **k <= hi } else { **k < hi };
                above && below
            })
            .map(|(k, v)| (*k, *v))
            .collect();
        prop_assert_eq!(scanned, expected);
    }

    /// The fixed-length layout agrees with the variable-length layout.
    #[test]
    fn prop_layouts_agree(
        writes in prop::collection::vec((any::<u64>(), any::<u64>()), 0..300),
        deletes in prop::collection::vec(any::<u64>(), 0..100),
    ) {
        let varlen: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        let fixlen: BPlusTreeFixLen<u64> = BPlusTreeFixLen::new(1_000, 0);

        for (k, v) in &writes {
            varlen.write(&key(*k), *v);
            fixlen.write(&key(*k), *v);
        }
        for k in &deletes {
            let a = varlen.delete(&key(*k));
            let b = fixlen.delete(&key(*k));
            prop_assert_eq!(a.is_ok(), b.is_ok());
        }
        for (k, _) in &writes {
            prop_assert_eq!(varlen.read(&key(*k)), fixlen.read(&key(*k)));
        }
    }

    /// Write-then-read and delete-then-read round-trips.
    #[test]
    fn prop_round_trip(k in varlen_key(), v in any::<u64>()) {
        let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 0);
        tree.write(&k, v);
        prop_assert_eq!(tree.read(&k), Some(v));
        tree.delete(&k).unwrap();
        prop_assert_eq!(tree.read(&k), None);
        prop_assert_eq!(tree.delete(&k), Err(bptree::KeyNotFound));
    }
}
