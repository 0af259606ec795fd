//! # bptree
//!
//! A concurrent, in-memory ordered index structured as a B+tree, built for
//! embedding in database-like data managers with mixed read/write
//! workloads from many threads.
//!
//! ## Design
//!
//! - **Optimistic reads**: traversals validate a per-node version word
//!   instead of taking read locks; writers lock only the nodes they touch.
//! - **Single-layer locking**: descent never holds a parent lock across a
//!   child visit. A key-range recheck after each lock acquisition (walking
//!   the right-sibling chain when a node's range moved) keeps lock-free
//!   descent correct under concurrent splits and merges.
//! - **Epoch-based reclamation**: retired pages are recycled only once
//!   every thread that could have observed them has left its epoch.
//!
//! Keys are encoded byte strings ordered by a pluggable comparator;
//! payloads are fixed-size `Copy` values. Two node layouts are provided:
//! variable-length keys ([`BPlusTreeVarLen`]) and fixed-length keys packed
//! inline ([`BPlusTreeFixLen`]).
//!
//! ## Example
//!
//! ```
//! use bptree::BPlusTreeVarLen;
//!
//! let tree: BPlusTreeVarLen<u64> = BPlusTreeVarLen::new(1_000, 1);
//! tree.write(b"apple", 1);
//! tree.write(b"banana", 2);
//! assert_eq!(tree.read(b"apple"), Some(1));
//!
//! let mut iter = tree.scan(None, None);
//! let mut count = 0;
//! while iter.has_next() {
//!     count += 1;
//!     iter.advance();
//! }
//! assert_eq!(count, 2);
//! ```

pub mod compare;
pub mod epoch;
pub mod iterator;
pub mod node;
pub mod ordering;
pub mod page;
pub mod tree;
pub mod version;

pub use compare::{KeyComp, Lexicographic};
pub use iterator::RecordIterator;
pub use node::ScanBound;
pub use tree::{BPlusTree, BPlusTreeFixLen, BPlusTreeVarLen, KeyExists, KeyNotFound, LevelStats};
