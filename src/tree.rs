//! The concurrent B+tree.
//!
//! [`BPlusTree`] ties the pieces together: an atomic root pointer, the
//! epoch reclaimer, optimistic descent over the chosen node layout, and the
//! structure-modification drivers in the `split` and `merge` submodules.
//!
//! # Concurrency protocol
//!
//! Descent never holds a parent lock while visiting a child. Safety comes
//! from three mechanisms working together:
//!
//! 1. optimistic version validation on every inner-node read,
//! 2. a key-range recheck after each lock acquisition (hopping right along
//!    the sibling chain when the node's range moved), and
//! 3. epoch-guarded pointer stability — a retired page stays mapped until
//!    every actor that could have seen it has left.
//!
//! Writers capture the descent path by pointer snapshot; split and merge
//! completion walk that stack back up, re-deriving it from the root when it
//! goes stale.

use std::marker::PhantomData;
use std::sync::atomic::AtomicPtr;
use std::time::Duration;

use crate::compare::{KeyComp, Lexicographic};
use crate::epoch::EpochGc;
use crate::iterator::RecordIterator;
use crate::node::fixlen::NodeFixLen;
use crate::node::varlen::NodeVarLen;
use crate::node::{InsertRc, MAX_KEY_LEN, NodeLayout, NodeRC, ReadRc, ScanBound};
use crate::ordering::{READ_ORD, RELAXED};
use crate::page::{PAGE_SIZE, Page, alloc_page};

mod bulkload;
mod merge;
mod split;

/// Back-off sleep between conflicting structure modifications.
pub(crate) const RETRY_WAIT: Duration = Duration::from_micros(10);

/// Descent-stack pre-reservation.
const EXPECTED_TREE_HEIGHT: usize = 8;

// ============================================================================
//  Public error types
// ============================================================================

/// Returned by [`BPlusTree::insert`] when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExists<V> {
    /// The payload currently stored under the key.
    pub payload: V,

    /// The containing node's version at the time of the attempt.
    pub version: u64,
}

impl<V> std::fmt::Display for KeyExists<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key already exists")
    }
}

impl<V: std::fmt::Debug> std::error::Error for KeyExists<V> {}

/// Returned by [`BPlusTree::update`] and [`BPlusTree::delete`] when the key
/// is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNotFound;

impl std::fmt::Display for KeyNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key not found")
    }
}

impl std::error::Error for KeyNotFound {}

/// Per-level usage reported by [`BPlusTree::collect_statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    /// Nodes at this level.
    pub node_count: usize,

    /// Bytes actually holding live data (headers included).
    pub live_bytes: usize,

    /// Bytes reserved (one page per node).
    pub reserved_bytes: usize,
}

// ============================================================================
//  BPlusTree
// ============================================================================

/// A concurrent in-memory B+tree over encoded keys.
///
/// Thread-safe for any mix of concurrent readers and writers. Parameterized
/// by the payload type `V` (fixed-size, `Copy`), the key comparator `C`,
/// and the node layout `N` — see [`BPlusTreeVarLen`] and
/// [`BPlusTreeFixLen`] for the two stock configurations.
pub struct BPlusTree<V, C: KeyComp = Lexicographic, N: NodeLayout<C> = NodeVarLen<C>> {
    /// Current root. Swapped with compare-and-publish on grow/shrink.
    root: AtomicPtr<N>,

    /// Deferred page reclamation.
    gc: EpochGc,

    /// Fixed key length for the fixed-length layout (ignored by varlen).
    key_len: u16,

    _marker: PhantomData<(V, C)>,
}

/// Variable-length-key tree.
pub type BPlusTreeVarLen<V, C = Lexicographic> = BPlusTree<V, C, NodeVarLen<C>>;

/// Fixed-length-key tree.
pub type BPlusTreeFixLen<V, C = Lexicographic> = BPlusTree<V, C, NodeFixLen<C>>;

// SAFETY: all shared state is reached through the root atomic, per-node
// version locks, and the reclaimer's mutexes; payloads are plain `Copy`
// data moved by value.
unsafe impl<V: Send, C: KeyComp, N: NodeLayout<C>> Send for BPlusTree<V, C, N> {}
// SAFETY: as above; `&self` operations synchronize through the node locks.
unsafe impl<V: Send + Sync, C: KeyComp, N: NodeLayout<C>> Sync for BPlusTree<V, C, N> {}

impl<V: Copy, C: KeyComp, N: NodeLayout<C>> BPlusTree<V, C, N> {
    /// Create an empty tree and start its reclaimer.
    ///
    /// # Arguments
    ///
    /// * `gc_interval_micros` - epoch advance interval for the reclaimer.
    /// * `gc_thread_num` - reclaimer worker threads (0 collects inline).
    #[must_use]
    pub fn new(gc_interval_micros: u64, gc_thread_num: usize) -> Self {
        Self::with_key_len(gc_interval_micros, gc_thread_num, 8)
    }

    /// Create an empty tree with an explicit fixed key length.
    ///
    /// The fixed-length layout stores and compares exactly `key_len` bytes
    /// per key; the variable-length layout ignores the setting.
    #[must_use]
    pub fn with_key_len(gc_interval_micros: u64, gc_thread_num: usize, key_len: u16) -> Self {
        let gc = EpochGc::new(gc_interval_micros, gc_thread_num);
        let page = alloc_page();
        // SAFETY: fresh zeroed page, exclusively ours.
        let root = unsafe { N::init(page, false, key_len) };
        // SAFETY: unpublished node.
        unsafe { (*root).set_payload_length(std::mem::size_of::<V>() as u16) };
        Self {
            root: AtomicPtr::new(root),
            gc,
            key_len,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn root_ptr(&self) -> *mut N {
        self.root.load(READ_ORD)
    }

    /// Reuse a reclaimed page or allocate a fresh one.
    pub(crate) fn acquire_page(&self) -> *mut Page {
        match self.gc.try_acquire_page() {
            Some(page) => {
                // Recycled pages carry their previous life's bytes.
                // SAFETY: the page is unaliased once handed back to us.
                unsafe { std::ptr::write_bytes(page.cast::<u8>(), 0, PAGE_SIZE) };
                page
            }
            None => alloc_page(),
        }
    }

    /// Allocate and imprint a node of this tree's layout.
    pub(crate) fn new_node(&self, is_inner: bool) -> *mut N {
        let page = self.acquire_page();
        // SAFETY: fresh zeroed page, exclusively ours.
        let node = unsafe { N::init(page, is_inner, self.key_len) };
        if !is_inner {
            // SAFETY: unpublished node.
            unsafe { (*node).set_payload_length(std::mem::size_of::<V>() as u16) };
        }
        node
    }

    pub(crate) fn gc(&self) -> &EpochGc {
        &self.gc
    }

    // ========================================================================
    //  Descent
    // ========================================================================

    /// Optimistically find the leaf that may hold `key`.
    ///
    /// # Safety
    ///
    /// An epoch guard must be held.
    pub(crate) unsafe fn search_leaf(&self, key: &[u8]) -> *mut N {
        let mut node = self.root_ptr();
        // SAFETY: nodes reached through validated child pointers stay
        // mapped under the caller's epoch guard.
        unsafe {
            while (*node).is_inner() {
                match N::search_child(node, key) {
                    Some((_, child)) => node = child,
                    // The node was retired under us; restart at the root.
                    None => node = self.root_ptr(),
                }
            }
        }
        node
    }

    /// Optimistically find the leftmost leaf.
    ///
    /// # Safety
    ///
    /// An epoch guard must be held.
    pub(crate) unsafe fn search_leftmost_leaf(&self) -> *mut N {
        let mut node = self.root_ptr();
        // SAFETY: as in `search_leaf`.
        unsafe {
            while (*node).is_inner() {
                match N::leftmost_child(node) {
                    Some(child) => node = child,
                    None => node = self.root_ptr(),
                }
            }
        }
        node
    }

    /// As [`Self::search_leaf`], capturing the inner path for upward SMO
    /// propagation. The returned leaf candidate is also the last stack
    /// entry.
    ///
    /// # Safety
    ///
    /// An epoch guard must be held.
    pub(crate) unsafe fn search_leaf_for_write(&self, key: &[u8], stack: &mut Vec<*mut N>) -> *mut N {
        stack.clear();
        let mut node = self.root_ptr();
        // SAFETY: as in `search_leaf`.
        unsafe {
            while (*node).is_inner() {
                match N::search_child(node, key) {
                    Some((cur, child)) => {
                        stack.push(cur);
                        node = child;
                    }
                    None => {
                        stack.clear();
                        node = self.root_ptr();
                    }
                }
            }
        }
        stack.push(node);
        node
    }

    /// Rebuild `stack` with the ancestors of `target`, located by
    /// descending for `key`. Loops until the descent actually passes
    /// through `target`, which the caller guarantees stays reachable.
    ///
    /// # Safety
    ///
    /// An epoch guard must be held; `target` must be pinned (locked or
    /// SMO-flagged) so it cannot be retired while we search.
    pub(crate) unsafe fn search_parent_stack(
        &self,
        key: &[u8],
        target: *mut N,
        stack: &mut Vec<*mut N>,
    ) {
        stack.clear();
        let mut node = self.root_ptr();
        loop {
            if node == target {
                return;
            }
            // SAFETY: as in `search_leaf`.
            unsafe {
                if (*node).is_inner() {
                    match N::search_child(node, key) {
                        Some((cur, child)) => {
                            if cur == target {
                                return;
                            }
                            stack.push(cur);
                            node = child;
                        }
                        None => {
                            stack.clear();
                            node = self.root_ptr();
                        }
                    }
                } else {
                    match N::find_covering(node, key) {
                        Some(cur) if cur == target => return,
                        // The target is not on this path yet (a racing SMO
                        // is mid-publication); re-descend after a pause.
                        _ => {
                            stack.clear();
                            std::thread::sleep(RETRY_WAIT);
                            node = self.root_ptr();
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    //  Point operations
    // ========================================================================

    /// Read the payload stored under `key`.
    #[must_use]
    pub fn read(&self, key: &[u8]) -> Option<V> {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let _guard = self.gc.enter();
        loop {
            // SAFETY: guard held for the whole dereference chain.
            let leaf = unsafe { self.search_leaf(key) };
            match unsafe { N::read::<V>(leaf, key) } {
                ReadRc::Found(payload) => return Some(payload),
                ReadRc::NotFound => return None,
                ReadRc::Retry => {}
            }
        }
    }

    /// Blind upsert of `key -> payload`.
    pub fn write(&self, key: &[u8], payload: V) {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let _guard = self.gc.enter();
        let mut stack = Vec::with_capacity(EXPECTED_TREE_HEIGHT);
        loop {
            // SAFETY: guard held; the stack holds pointer snapshots only.
            unsafe {
                let candidate = self.search_leaf_for_write(key, &mut stack);
                let Some(leaf) = N::range_lock_x(candidate, key) else {
                    continue;
                };
                if let Some(last) = stack.last_mut() {
                    *last = leaf;
                }
                match (*leaf).write(key, payload) {
                    NodeRC::Completed => return,
                    NodeRC::NeedSplit => {
                        self.split_insert(&mut stack, leaf, key, payload);
                        return;
                    }
                    _ => unreachable!("write returns Completed or NeedSplit"),
                }
            }
        }
    }

    /// Insert `key -> payload` if the key is absent.
    ///
    /// Returns the node version of the committed insert, or the existing
    /// payload and version when the key is already present.
    pub fn insert(&self, key: &[u8], payload: V) -> Result<u64, KeyExists<V>> {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let _guard = self.gc.enter();
        let mut stack = Vec::with_capacity(EXPECTED_TREE_HEIGHT);
        loop {
            // SAFETY: guard held.
            unsafe {
                let candidate = self.search_leaf_for_write(key, &mut stack);
                let Some(leaf) = N::range_lock_x(candidate, key) else {
                    continue;
                };
                if let Some(last) = stack.last_mut() {
                    *last = leaf;
                }
                match (*leaf).insert(key, payload) {
                    InsertRc::Done(version) => return Ok(version),
                    InsertRc::KeyPresent { payload, version } => {
                        return Err(KeyExists { payload, version });
                    }
                    InsertRc::NeedSplit => {
                        return Ok(self.split_insert(&mut stack, leaf, key, payload));
                    }
                }
            }
        }
    }

    /// Overwrite the payload of an existing key.
    pub fn update(&self, key: &[u8], payload: V) -> Result<(), KeyNotFound> {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let _guard = self.gc.enter();
        loop {
            // SAFETY: guard held.
            unsafe {
                let candidate = self.search_leaf(key);
                let Some(leaf) = N::range_lock_x(candidate, key) else {
                    continue;
                };
                match (*leaf).update(key, payload) {
                    NodeRC::Completed => return Ok(()),
                    NodeRC::KeyNotPresent => return Err(KeyNotFound),
                    _ => unreachable!("update returns Completed or KeyNotPresent"),
                }
            }
        }
    }

    /// Remove `key`.
    pub fn delete(&self, key: &[u8]) -> Result<(), KeyNotFound> {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let _guard = self.gc.enter();
        let mut stack = Vec::with_capacity(EXPECTED_TREE_HEIGHT);
        loop {
            // SAFETY: guard held.
            unsafe {
                let candidate = self.search_leaf_for_write(key, &mut stack);
                let Some(leaf) = N::range_lock_x(candidate, key) else {
                    continue;
                };
                if let Some(last) = stack.last_mut() {
                    *last = leaf;
                }
                match (*leaf).delete(key) {
                    NodeRC::Completed => return Ok(()),
                    NodeRC::KeyNotPresent => return Err(KeyNotFound),
                    NodeRC::NeedMerge => {
                        self.merge_path(&mut stack, leaf);
                        return Ok(());
                    }
                    _ => unreachable!("delete returns Completed, KeyNotPresent, or NeedMerge"),
                }
            }
        }
    }

    // ========================================================================
    //  Range scans
    // ========================================================================

    /// Open a forward scan over `[begin, end]` (each bound optional and
    /// independently inclusive or exclusive).
    ///
    /// The iterator holds the current leaf's shared lock and an epoch
    /// guard until exhausted or dropped.
    #[must_use]
    pub fn scan<'t>(
        &'t self,
        begin: Option<ScanBound<'t>>,
        end: Option<ScanBound<'t>>,
    ) -> RecordIterator<'t, V, C, N> {
        let guard = self.gc.enter();
        // SAFETY: guard held; the S lock taken here transfers into the
        // iterator.
        let node = unsafe {
            loop {
                match &begin {
                    Some(bound) => {
                        let leaf = self.search_leaf(bound.key);
                        if let Some(node) = N::range_lock_s(leaf, bound.key) {
                            break node;
                        }
                    }
                    None => {
                        let leaf = self.search_leftmost_leaf();
                        (*leaf).lock().lock_s();
                        if !(*leaf).lock().is_deleted() {
                            break leaf;
                        }
                        (*leaf).lock().unlock_s();
                    }
                }
            }
        };
        // SAFETY: node is S-locked by us.
        let (pos, is_end, end_pos) = unsafe {
            let node_ref = &*node;
            let pos = node_ref.search_begin_position(begin.as_ref());
            let (is_end, end_pos) = node_ref.search_end_position(end.as_ref());
            (pos, is_end, end_pos)
        };
        RecordIterator::new(node, pos, end_pos, is_end, end, guard)
    }

    // ========================================================================
    //  Statistics
    // ========================================================================

    /// Collect per-level node counts and byte usage under shared locks.
    #[must_use]
    pub fn collect_statistics(&self) -> Vec<LevelStats> {
        let _guard = self.gc.enter();
        let mut stats = Vec::new();
        // SAFETY: guard held; the walk locks each node in shared mode.
        unsafe { self.collect_level(self.root_ptr(), 0, &mut stats) };
        stats
    }

    unsafe fn collect_level(&self, node: *mut N, level: usize, stats: &mut Vec<LevelStats>) {
        // SAFETY: node reached through an S-locked parent (or the root)
        // under the caller's epoch guard.
        let node_ref = unsafe { &*node };
        node_ref.lock().lock_s();

        if stats.len() <= level {
            stats.push(LevelStats::default());
        }
        let entry = &mut stats[level];
        entry.node_count += 1;
        entry.live_bytes += node_ref.used_size();
        entry.reserved_bytes += PAGE_SIZE;

        if node_ref.is_inner() {
            for pos in 0..node_ref.record_count() {
                // SAFETY: pos is in range and the node is S-locked.
                let child = unsafe { node_ref.child_at(pos) };
                // SAFETY: child is pinned by the guard and the parent lock.
                unsafe { self.collect_level(child, level + 1, stats) };
            }
        }
        node_ref.lock().unlock_s();
    }

    // ========================================================================
    //  Teardown
    // ========================================================================
}

impl<V, C: KeyComp, N: NodeLayout<C>> Drop for BPlusTree<V, C, N> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves quiescence; the reclaimer (dropped
        // after this) frees its own queues separately.
        unsafe { delete_children::<C, N>(self.root.load(RELAXED)) };
    }
}

/// Free a whole subtree, children first. Assumes no concurrent actors.
pub(crate) unsafe fn delete_children<C: KeyComp, N: NodeLayout<C>>(node: *mut N) {
    // SAFETY: exclusive access per caller contract.
    unsafe {
        if (*node).is_inner() {
            for pos in 0..(*node).record_count() {
                delete_children::<C, N>((*node).child_at(pos));
            }
        }
        crate::page::release_page(node.cast());
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    fn tree() -> BPlusTreeVarLen<u64> {
        BPlusTree::new(1_000, 0)
    }

    #[test]
    fn test_empty_tree() {
        let t = tree();
        assert_eq!(t.read(&key(1)), None);
        assert_eq!(t.delete(&key(1)), Err(KeyNotFound));
        assert_eq!(t.update(&key(1), 0), Err(KeyNotFound));
        let mut iter = t.scan(None, None);
        assert!(!iter.has_next());
    }

    #[test]
    fn test_insert_read_scan() {
        let t = tree();
        t.insert(&key(1), 10).unwrap();
        t.insert(&key(2), 20).unwrap();
        t.insert(&key(3), 30).unwrap();

        assert_eq!(t.read(&key(2)), Some(20));

        let k1 = key(1);
        let k3 = key(3);
        let mut iter = t.scan(
            Some(ScanBound {
                key: &k1,
                inclusive: true,
            }),
            Some(ScanBound {
                key: &k3,
                inclusive: true,
            }),
        );
        let mut collected = Vec::new();
        while iter.has_next() {
            let (k, v) = iter.get();
            collected.push((k.to_vec(), v));
            iter.advance();
        }
        assert_eq!(collected, vec![
            (key(1).to_vec(), 10),
            (key(2).to_vec(), 20),
            (key(3).to_vec(), 30),
        ]);
    }

    #[test]
    fn test_write_overwrites() {
        let t = tree();
        t.write(&key(5), 50);
        t.write(&key(5), 51);
        assert_eq!(t.read(&key(5)), Some(51));
    }

    #[test]
    fn test_insert_existing_returns_payload() {
        let t = tree();
        t.insert(&key(7), 70).unwrap();
        let err = t.insert(&key(7), 71).unwrap_err();
        assert_eq!(err.payload, 70);
        assert_eq!(t.read(&key(7)), Some(70));
    }

    #[test]
    fn test_single_record_delete_leaves_valid_tree() {
        let t = tree();
        t.insert(&key(42), 1).unwrap();
        t.delete(&key(42)).unwrap();
        assert_eq!(t.read(&key(42)), None);
        assert_eq!(t.delete(&key(42)), Err(KeyNotFound));
        // The tree still accepts work.
        t.insert(&key(42), 2).unwrap();
        assert_eq!(t.read(&key(42)), Some(2));
    }

    #[test]
    fn test_ascending_inserts_split_and_stay_readable() {
        let t = tree();
        for i in 0..10_000u64 {
            t.write(&key(i), i * 3);
        }
        for i in 0..10_000u64 {
            assert_eq!(t.read(&key(i)), Some(i * 3), "key {i}");
        }
        let stats = t.collect_statistics();
        assert!(stats.len() >= 2, "10k records must not fit a single node");
        // Exactly one root.
        assert_eq!(stats[0].node_count, 1);
    }

    #[test]
    fn test_scan_middle_range_after_splits() {
        let t = tree();
        for i in 0..10_000u64 {
            t.insert(&key(i), i).unwrap();
        }
        let lo = key(2_500);
        let hi = key(7_500);
        let mut iter = t.scan(
            Some(ScanBound {
                key: &lo,
                inclusive: true,
            }),
            Some(ScanBound {
                key: &hi,
                inclusive: true,
            }),
        );
        let mut expected = 2_500u64;
        let mut count = 0usize;
        while iter.has_next() {
            let (k, v) = iter.get();
            assert_eq!(k, key(expected).as_slice());
            assert_eq!(v, expected);
            expected += 1;
            count += 1;
            iter.advance();
        }
        assert_eq!(count, 5_001);
    }

    #[test]
    fn test_deletes_merge_back_down() {
        let t = tree();
        for i in 0..5_000u64 {
            t.insert(&key(i), i).unwrap();
        }
        let full_levels = t.collect_statistics().len();
        for i in 0..5_000u64 {
            t.delete(&key(i)).unwrap();
        }
        for i in 0..5_000u64 {
            assert_eq!(t.read(&key(i)), None);
        }
        // Cascaded merges shrink the tree.
        let drained = t.collect_statistics();
        assert!(
            drained.len() < full_levels,
            "merges should have removed levels ({full_levels} -> {})",
            drained.len()
        );
        // And the tree remains usable.
        t.insert(&key(1), 1).unwrap();
        assert_eq!(t.read(&key(1)), Some(1));
    }

    #[test]
    fn test_delete_idempotence() {
        let t = tree();
        t.insert(&key(9), 9).unwrap();
        assert_eq!(t.delete(&key(9)), Ok(()));
        assert_eq!(t.delete(&key(9)), Err(KeyNotFound));
    }

    #[test]
    fn test_fixlen_tree_basics() {
        let t: BPlusTreeFixLen<u64> = BPlusTree::new(1_000, 0);
        for i in 0..3_000u64 {
            t.write(&key(i), i + 1);
        }
        for i in 0..3_000u64 {
            assert_eq!(t.read(&key(i)), Some(i + 1));
        }
        for i in (0..3_000u64).step_by(2) {
            t.delete(&key(i)).unwrap();
        }
        for i in 0..3_000u64 {
            let expected = if i % 2 == 0 { None } else { Some(i + 1) };
            assert_eq!(t.read(&key(i)), expected);
        }
    }

    #[test]
    fn test_statistics_shape() {
        let t = tree();
        for i in 0..2_000u64 {
            t.insert(&key(i), i).unwrap();
        }
        let stats = t.collect_statistics();
        assert!(!stats.is_empty());
        for level in &stats {
            assert!(level.live_bytes <= level.reserved_bytes);
            assert_eq!(level.reserved_bytes, level.node_count * PAGE_SIZE);
        }
        // Leaves outnumber every inner level.
        let leaves = stats.last().unwrap();
        assert!(leaves.node_count >= stats[0].node_count);
    }
}
