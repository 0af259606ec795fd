//! Shared helpers for integration tests.

#![allow(dead_code)] // Not every test binary uses every helper.

use bptree::ScanBound;

/// Big-endian encoding: numeric order == lexicographic byte order.
pub fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

/// Decode a key produced by [`key`].
pub fn decode(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Inclusive scan bound.
pub fn closed(key: &[u8]) -> ScanBound<'_> {
    ScanBound {
        key,
        inclusive: true,
    }
}

/// Exclusive scan bound.
pub fn open(key: &[u8]) -> ScanBound<'_> {
    ScanBound {
        key,
        inclusive: false,
    }
}
