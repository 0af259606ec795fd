//! Lock-coupled record iterator over the leaf chain.
//!
//! A [`RecordIterator`] holds the current leaf's shared lock for the
//! duration of one leaf visit — so a visit observes a version-consistent
//! slice of the tree — and hops to the right sibling under lock coupling
//! (the next leaf's S is taken before the current one's is released). The
//! epoch guard taken at [`scan`](crate::tree::BPlusTree::scan) time lives
//! inside the iterator, pinning every page the cursor can reach until the
//! iterator is exhausted or dropped.
//!
//! Iterators are one-shot and move-only; each scan call produces a fresh
//! one.

use std::marker::PhantomData;

use crate::compare::KeyComp;
use crate::epoch::EpochGuard;
use crate::node::{NodeLayout, ScanBound};
use crate::tree::BPlusTree;

/// Forward cursor over the records of a scan range.
///
/// Produced by [`BPlusTree::scan`]. The typical loop:
///
/// ```ignore
/// let mut iter = tree.scan(None, None);
/// while iter.has_next() {
///     let (key, payload) = iter.get();
///     // ...
///     iter.advance();
/// }
/// ```
pub struct RecordIterator<'t, V: Copy, C: KeyComp, N: NodeLayout<C>> {
    /// Current leaf; S-locked while `node_locked`.
    node: *mut N,

    /// Current slot.
    pos: usize,

    /// First out-of-range slot in this leaf.
    end_pos: usize,

    /// Whether no leaf right of this one can hold in-range records.
    is_end: bool,

    /// User-supplied end bound.
    end_key: Option<ScanBound<'t>>,

    /// Whether we still hold the current leaf's shared lock.
    node_locked: bool,

    /// Pins reclamation for every page this cursor can reach.
    _guard: EpochGuard,

    _marker: PhantomData<&'t BPlusTree<V, C, N>>,
}

impl<'t, V: Copy, C: KeyComp, N: NodeLayout<C>> RecordIterator<'t, V, C, N> {
    pub(crate) fn new(
        node: *mut N,
        pos: usize,
        end_pos: usize,
        is_end: bool,
        end_key: Option<ScanBound<'t>>,
        guard: EpochGuard,
    ) -> Self {
        Self {
            node,
            pos,
            end_pos,
            is_end,
            end_key,
            node_locked: true,
            _guard: guard,
            _marker: PhantomData,
        }
    }

    /// Check whether a record is available, hopping leaves as needed.
    ///
    /// Returns false exactly once; at that point the leaf lock has been
    /// released and the iterator is exhausted.
    pub fn has_next(&mut self) -> bool {
        debug_assert!(self.node_locked, "has_next on an exhausted iterator");
        loop {
            // SAFETY: we hold S on `node`; the guard pins the page.
            let node_ref = unsafe { &*self.node };

            // Skip tombstoned slots.
            while self.pos < self.end_pos && node_ref.record_is_deleted(self.pos) {
                self.pos += 1;
            }
            if self.pos < self.end_pos {
                return true;
            }

            // This leaf is drained; stop or hop right.
            if self.is_end {
                node_ref.lock().unlock_s();
                self.node_locked = false;
                return false;
            }
            // SAFETY: S held, sibling exists (is_end was false), guard
            // pins both pages across the coupling hop.
            self.node = unsafe { N::next_for_read(self.node) };
            self.pos = 0;
            // SAFETY: S now held on the new node.
            let (is_end, end_pos) = unsafe { (*self.node).search_end_position(self.end_key.as_ref()) };
            self.is_end = is_end;
            self.end_pos = end_pos;
        }
    }

    /// The current record's key.
    ///
    /// Valid only after [`Self::has_next`] returned true; the borrow is
    /// backed by the leaf held under the iterator's shared lock.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.node_locked && self.pos < self.end_pos);
        // SAFETY: S held on `node`, pos checked by the has_next contract.
        unsafe { (*self.node).key_at(self.pos) }
    }

    /// The current record's payload.
    #[must_use]
    pub fn payload(&self) -> V {
        debug_assert!(self.node_locked && self.pos < self.end_pos);
        // SAFETY: S held on `node`, pos checked by the has_next contract.
        unsafe { (*self.node).payload_at::<V>(self.pos) }
    }

    /// The current record as a `(key, payload)` pair.
    #[must_use]
    pub fn get(&self) -> (&[u8], V) {
        (self.key(), self.payload())
    }

    /// Step to the next slot.
    pub fn advance(&mut self) {
        self.pos += 1;
    }
}

impl<V: Copy, C: KeyComp, N: NodeLayout<C>> Drop for RecordIterator<'_, V, C, N> {
    fn drop(&mut self) {
        if self.node_locked {
            // SAFETY: we still hold S on the current leaf.
            unsafe { (*self.node).lock().unlock_s() };
        }
        // The epoch guard releases itself afterwards.
    }
}
