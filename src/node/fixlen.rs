//! Fixed-length record layout.
//!
//! Every key in the node has the same construction-time length and every
//! payload the same fixed length, so records pack inline with no per-slot
//! descriptors:
//!
//! ```text
//! | header | rec[0] rec[1] rec[2] ... ->      ...      <- high key |
//! ```
//!
//! Slot `i` lives at byte `i * (key_len + pay_len)`. The tail of the block
//! reserves one key slot for the high key. Deletion shifts the suffix down
//! immediately — there is no tombstone state in this layout, so
//! `record_is_deleted` is constantly false and scans never skip here.
//!
//! Concurrency follows the same rules as the variable-length layout: the
//! version word is first, header counters are atomics, and raw record
//! bytes read optimistically are validated against the version before use.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU16};

use crate::compare::KeyComp;
use crate::node::{
    InsertRc, MAX_MERGED_SIZE, MIN_FREE_SPACE, MIN_USED_SPACE, NodeLayout, NodeRC, PTR_LEN, ReadRc,
    ScanBound,
};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::page::{PAGE_SIZE, Page};
use crate::version::VersionLock;

/// Header bytes preceding the data block.
const HEADER_LEN: usize = 32;

/// Data block bytes (packed records + high-key slot).
const BLOCK_SIZE: usize = PAGE_SIZE - HEADER_LEN;

// ============================================================================
//  NodeFixLen
// ============================================================================

/// A page-resident node with fixed-length keys and payloads.
#[repr(C)]
pub struct NodeFixLen<C: KeyComp> {
    /// Version-and-lock word. Must stay the first field.
    lock: VersionLock,

    /// Right sibling at the same level.
    next: AtomicPtr<NodeFixLen<C>>,

    /// Node kind; written once at init, before publication.
    is_inner: u16,

    /// Record count.
    record_count: AtomicU16,

    /// Fixed key length; written once at init.
    key_len: u16,

    /// Fixed payload length; child-pointer size on inner nodes, set via
    /// `set_payload_length` on leaves before first use.
    pay_len: AtomicU16,

    /// Whether the high-key slot at the block tail is occupied.
    has_high_key: AtomicU16,

    _pad: [u16; 3],

    /// Packed records.
    block: UnsafeCell<[u8; BLOCK_SIZE]>,

    _comp: PhantomData<C>,
}

impl<C: KeyComp> NodeFixLen<C> {
    const LAYOUT_CHECK: () = {
        assert!(std::mem::size_of::<Self>() == PAGE_SIZE);
        assert!(std::mem::align_of::<Self>() == 8);
    };

    #[inline]
    fn block_ptr(&self) -> *mut u8 {
        self.block.get().cast()
    }

    #[inline]
    fn count(&self) -> usize {
        self.record_count.load(READ_ORD) as usize
    }

    #[inline]
    fn rec_len(&self) -> usize {
        self.key_len as usize + self.pay_len.load(RELAXED) as usize
    }

    /// Records that fit alongside the reserved high-key slot.
    #[inline]
    fn capacity(&self) -> usize {
        (BLOCK_SIZE - self.key_len as usize) / self.rec_len()
    }

    /// Bulk-load fill target, leaving the insert reserve free.
    #[inline]
    fn bulk_capacity(&self) -> usize {
        (BLOCK_SIZE - self.key_len as usize - MIN_FREE_SPACE) / self.rec_len()
    }

    #[inline]
    fn slot_ptr(&self, pos: usize) -> *mut u8 {
        debug_assert!(pos * self.rec_len() + self.rec_len() <= BLOCK_SIZE);
        // SAFETY: in-block offset, checked above.
        unsafe { self.block_ptr().add(pos * self.rec_len()) }
    }

    /// Borrow the key bytes of slot `pos`.
    ///
    /// Concurrently mutable unless the caller holds a lock; optimistic
    /// callers validate the version before trusting comparisons.
    #[inline]
    fn key_bytes(&self, pos: usize) -> &[u8] {
        // SAFETY: in-block range; the page outlives epoch-guarded readers.
        unsafe { std::slice::from_raw_parts(self.slot_ptr(pos), self.key_len as usize) }
    }

    /// Borrow the high key, if any. Stable only under a lock.
    #[inline]
    fn high_key(&self) -> Option<&[u8]> {
        if self.has_high_key.load(READ_ORD) == 0 {
            return None;
        }
        let offset = BLOCK_SIZE - self.key_len as usize;
        // SAFETY: the tail slot is in-block.
        Some(unsafe { std::slice::from_raw_parts(self.block_ptr().add(offset), self.key_len as usize) })
    }

    /// Content bytes, for merge-fit decisions.
    #[inline]
    fn live_size(&self) -> usize {
        self.count() * self.rec_len()
    }

    /// Write `(key, payload)` into slot `pos`. Caller holds X (or the node
    /// is unpublished) and the slot is reserved.
    fn write_slot<P: Copy>(&self, pos: usize, key: &[u8], payload: P) {
        debug_assert_eq!(key.len(), self.key_len as usize);
        debug_assert_eq!(std::mem::size_of::<P>(), self.pay_len.load(RELAXED) as usize);
        // SAFETY: in-block exclusive write.
        unsafe {
            let dst = self.slot_ptr(pos);
            std::ptr::copy_nonoverlapping(key.as_ptr(), dst, key.len());
            std::ptr::write_unaligned(dst.add(key.len()).cast::<P>(), payload);
        }
    }

    /// Lower-bound search: `(found, pos)`.
    fn search(&self, key: &[u8]) -> (bool, usize) {
        let count = self.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match C::compare(self.key_bytes(mid), key) {
                CmpOrdering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < count && C::eq(self.key_bytes(lo), key);
        (found, lo)
    }

    /// Routing position: greatest slot with key `<= key`, slot 0's key
    /// treated as negative infinity.
    fn search_child_pos(&self, key: &[u8]) -> usize {
        let count = self.count();
        let mut lo = 1usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match C::compare(self.key_bytes(mid), key) {
                CmpOrdering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        lo - 1
    }

    /// Exact-match search among routing slots (slot 0 excluded).
    fn search_routing(&self, key: &[u8]) -> (bool, usize) {
        let count = self.count();
        let mut lo = 1usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match C::compare(self.key_bytes(mid), key) {
                CmpOrdering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < count && C::eq(self.key_bytes(lo), key);
        (found, lo)
    }

    /// Open slot `pos` by shifting the suffix right. Caller holds X and
    /// capacity was checked.
    fn shift_up(&self, pos: usize) {
        let count = self.count();
        let rec_len = self.rec_len();
        // SAFETY: overlapping in-block ranges; exclusive writer.
        unsafe {
            std::ptr::copy(
                self.slot_ptr(pos),
                self.slot_ptr(pos + 1),
                (count - pos) * rec_len,
            );
        }
        self.record_count.store(count as u16 + 1, WRITE_ORD);
    }

    /// Close slot `pos` by shifting the suffix left. Caller holds X.
    fn shift_down(&self, pos: usize) {
        let count = self.count();
        let rec_len = self.rec_len();
        // SAFETY: overlapping in-block ranges; exclusive writer.
        unsafe {
            std::ptr::copy(
                self.slot_ptr(pos + 1),
                self.slot_ptr(pos),
                (count - pos - 1) * rec_len,
            );
        }
        self.record_count.store(count as u16 - 1, WRITE_ORD);
    }

    /// Install the high key in the reserved tail slot. Caller holds X (or
    /// the node is unpublished).
    fn install_high_key(&self, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_len as usize);
        let offset = BLOCK_SIZE - self.key_len as usize;
        // SAFETY: the tail slot is in-block; exclusive writer.
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.block_ptr().add(offset), key.len());
        }
        self.has_high_key.store(1, WRITE_ORD);
    }

    /// Verify intra-node invariants. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn debug_assert_invariants(&self) {
        for pos in 1..self.count() {
            assert!(
                C::lt(self.key_bytes(pos - 1), self.key_bytes(pos)),
                "slot keys out of order at {pos}"
            );
        }
        if let (Some(high), true) = (self.high_key(), self.count() > 0) {
            assert!(
                C::lt(self.key_bytes(self.count() - 1), high),
                "high key not above the last slot"
            );
        }
    }

    /// No-op in release builds.
    #[cfg(not(debug_assertions))]
    pub fn debug_assert_invariants(&self) {}
}

// ============================================================================
//  NodeLayout implementation
// ============================================================================

// SAFETY: size/alignment are checked at compile time, the version word is
// the first field, and every method upholds the documented lock contract.
unsafe impl<C: KeyComp> NodeLayout<C> for NodeFixLen<C> {
    unsafe fn init(page: *mut Page, is_inner: bool, key_len: u16) -> *mut Self {
        let _: () = Self::LAYOUT_CHECK;
        debug_assert!(key_len > 0 && key_len as usize <= crate::node::MAX_KEY_LEN);
        let node: *mut Self = page.cast();
        let pay_len = if is_inner { PTR_LEN as u16 } else { 0 };
        // SAFETY: the page is zeroed and exclusively owned.
        unsafe {
            (&raw mut (*node).lock).write(VersionLock::new());
            (&raw mut (*node).next).write(AtomicPtr::new(std::ptr::null_mut()));
            (&raw mut (*node).is_inner).write(u16::from(is_inner));
            (&raw mut (*node).record_count).write(AtomicU16::new(0));
            (&raw mut (*node).key_len).write(key_len);
            (&raw mut (*node).pay_len).write(AtomicU16::new(pay_len));
            (&raw mut (*node).has_high_key).write(AtomicU16::new(0));
        }
        node
    }

    unsafe fn init_root(
        page: *mut Page,
        key_len: u16,
        sep_key: &[u8],
        left: *mut Self,
        right: *mut Self,
    ) -> *mut Self {
        // SAFETY: caller contract matches `init`.
        let node = unsafe { Self::init(page, true, key_len) };
        // SAFETY: the node is unpublished; plain writes are exclusive.
        let node_ref = unsafe { &*node };
        // Slot 0's key is never compared; the zeroed page leaves it blank.
        let zeros = vec![0u8; key_len as usize];
        node_ref.write_slot(0, &zeros, left);
        node_ref.write_slot(1, sep_key, right);
        node_ref.record_count.store(2, WRITE_ORD);
        node
    }

    fn set_payload_length(&self, pay_len: u16) {
        debug_assert_eq!(self.count(), 0, "payload length set after first record");
        self.pay_len.store(pay_len, RELAXED);
    }

    fn is_inner(&self) -> bool {
        self.is_inner != 0
    }

    fn record_count(&self) -> usize {
        self.count()
    }

    fn lock(&self) -> &VersionLock {
        &self.lock
    }

    fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    fn used_size(&self) -> usize {
        HEADER_LEN + self.live_size()
    }

    fn copy_high_key_into(&self, buf: &mut [u8]) -> Option<usize> {
        let high = self.high_key()?;
        buf[..high.len()].copy_from_slice(high);
        Some(high.len())
    }

    fn key_at(&self, pos: usize) -> &[u8] {
        debug_assert!(pos < self.count());
        self.key_bytes(pos)
    }

    fn record_is_deleted(&self, _pos: usize) -> bool {
        false
    }

    fn payload_at<P: Copy>(&self, pos: usize) -> P {
        debug_assert!(pos < self.count());
        // SAFETY: in-block read; caller holds a lock.
        unsafe {
            std::ptr::read_unaligned(self.slot_ptr(pos).add(self.key_len as usize).cast::<P>())
        }
    }

    unsafe fn child_at(&self, pos: usize) -> *mut Self {
        debug_assert!(self.is_inner());
        self.payload_at::<*mut Self>(pos)
    }

    unsafe fn search_child(node: *mut Self, key: &[u8]) -> Option<(*mut Self, *mut Self)> {
        let mut cur = node;
        loop {
            // SAFETY: live page per caller contract (epoch guard held).
            let node_ref = unsafe { &*cur };
            let version = node_ref.lock.get_version();
            if VersionLock::snapshot_deleted(version) {
                return None;
            }
            if let Some(high) = node_ref.high_key() {
                if C::compare(key, high) != CmpOrdering::Less {
                    let next = node_ref.next.load(READ_ORD);
                    if !node_ref.lock.has_same_version(version) {
                        continue;
                    }
                    cur = next;
                    continue;
                }
            }
            let pos = node_ref.search_child_pos(key);
            let child = node_ref.payload_at::<*mut Self>(pos);
            if !node_ref.lock.has_same_version(version) {
                continue;
            }
            return Some((cur, child));
        }
    }

    unsafe fn leftmost_child(node: *mut Self) -> Option<*mut Self> {
        loop {
            // SAFETY: live page per caller contract.
            let node_ref = unsafe { &*node };
            let version = node_ref.lock.get_version();
            if VersionLock::snapshot_deleted(version) {
                return None;
            }
            let child = node_ref.payload_at::<*mut Self>(0);
            if !node_ref.lock.has_same_version(version) {
                continue;
            }
            return Some(child);
        }
    }

    unsafe fn find_covering(node: *mut Self, key: &[u8]) -> Option<*mut Self> {
        let mut cur = node;
        loop {
            // SAFETY: live page per caller contract.
            let node_ref = unsafe { &*cur };
            let version = node_ref.lock.get_version();
            if VersionLock::snapshot_deleted(version) {
                return None;
            }
            if let Some(high) = node_ref.high_key() {
                if C::compare(key, high) != CmpOrdering::Less {
                    let next = node_ref.next.load(READ_ORD);
                    if !node_ref.lock.has_same_version(version) {
                        continue;
                    }
                    cur = next;
                    continue;
                }
            }
            if !node_ref.lock.has_same_version(version) {
                continue;
            }
            return Some(cur);
        }
    }

    unsafe fn read<P: Copy>(node: *mut Self, key: &[u8]) -> ReadRc<P> {
        let mut cur = node;
        loop {
            // SAFETY: live page per caller contract.
            let node_ref = unsafe { &*cur };
            let version = node_ref.lock.get_version();
            if VersionLock::snapshot_deleted(version) {
                return ReadRc::Retry;
            }
            if let Some(high) = node_ref.high_key() {
                if C::compare(key, high) != CmpOrdering::Less {
                    let next = node_ref.next.load(READ_ORD);
                    if !node_ref.lock.has_same_version(version) {
                        continue;
                    }
                    cur = next;
                    continue;
                }
            }
            let (found, pos) = node_ref.search(key);
            let result = if found {
                // SAFETY: in-block read; a torn value fails validation.
                let payload = unsafe {
                    std::ptr::read_unaligned(
                        node_ref
                            .slot_ptr(pos)
                            .add(node_ref.key_len as usize)
                            .cast::<P>(),
                    )
                };
                ReadRc::Found(payload)
            } else {
                ReadRc::NotFound
            };
            if !node_ref.lock.has_same_version(version) {
                continue;
            }
            return result;
        }
    }

    unsafe fn range_lock_x(node: *mut Self, key: &[u8]) -> Option<*mut Self> {
        let mut cur = node;
        // SAFETY: live page per caller contract.
        unsafe { (*cur).lock.lock_x() };
        loop {
            // SAFETY: cur is live and X-locked by us.
            let node_ref = unsafe { &*cur };
            if node_ref.lock.is_deleted() {
                node_ref.lock.unlock_x();
                return None;
            }
            match node_ref.high_key() {
                Some(high) if C::compare(key, high) != CmpOrdering::Less => {
                    let next = node_ref.next.load(READ_ORD);
                    debug_assert!(!next.is_null(), "high key implies a right sibling");
                    // SAFETY: next is reachable under our lock + guard.
                    unsafe { (*next).lock.lock_x() };
                    node_ref.lock.unlock_x();
                    cur = next;
                }
                _ => return Some(cur),
            }
        }
    }

    unsafe fn range_lock_s(node: *mut Self, key: &[u8]) -> Option<*mut Self> {
        let mut cur = node;
        // SAFETY: live page per caller contract.
        unsafe { (*cur).lock.lock_s() };
        loop {
            // SAFETY: cur is live and S-locked by us.
            let node_ref = unsafe { &*cur };
            if node_ref.lock.is_deleted() {
                node_ref.lock.unlock_s();
                return None;
            }
            match node_ref.high_key() {
                Some(high) if C::compare(key, high) != CmpOrdering::Less => {
                    let next = node_ref.next.load(READ_ORD);
                    debug_assert!(!next.is_null(), "high key implies a right sibling");
                    // SAFETY: next is reachable under our lock + guard.
                    unsafe { (*next).lock.lock_s() };
                    node_ref.lock.unlock_s();
                    cur = next;
                }
                _ => return Some(cur),
            }
        }
    }

    fn write<P: Copy>(&self, key: &[u8], payload: P) -> NodeRC {
        let (found, pos) = self.search(key);
        if found {
            // SAFETY: in-block write under X; payload length is fixed.
            unsafe {
                std::ptr::write_unaligned(
                    self.slot_ptr(pos).add(self.key_len as usize).cast::<P>(),
                    payload,
                );
            }
            self.lock.unlock_x_bump();
            return NodeRC::Completed;
        }
        if self.count() >= self.capacity() {
            return NodeRC::NeedSplit;
        }
        self.shift_up(pos);
        self.write_slot(pos, key, payload);
        self.lock.unlock_x_bump();
        NodeRC::Completed
    }

    fn insert<P: Copy>(&self, key: &[u8], payload: P) -> InsertRc<P> {
        let (found, pos) = self.search(key);
        if found {
            let existing = self.payload_at::<P>(pos);
            let version = self.lock.current_version();
            self.lock.unlock_x();
            return InsertRc::KeyPresent {
                payload: existing,
                version,
            };
        }
        if self.count() >= self.capacity() {
            return InsertRc::NeedSplit;
        }
        self.shift_up(pos);
        self.write_slot(pos, key, payload);
        InsertRc::Done(self.lock.unlock_x_bump())
    }

    fn update<P: Copy>(&self, key: &[u8], payload: P) -> NodeRC {
        let (found, pos) = self.search(key);
        if !found {
            self.lock.unlock_x();
            return NodeRC::KeyNotPresent;
        }
        // SAFETY: in-block write under X; payload length is fixed.
        unsafe {
            std::ptr::write_unaligned(
                self.slot_ptr(pos).add(self.key_len as usize).cast::<P>(),
                payload,
            );
        }
        self.lock.unlock_x_bump();
        NodeRC::Completed
    }

    fn delete(&self, key: &[u8]) -> NodeRC {
        let (found, pos) = self.search(key);
        if !found {
            self.lock.unlock_x();
            return NodeRC::KeyNotPresent;
        }
        self.shift_down(pos);

        if self.used_size() < MIN_USED_SPACE {
            self.lock.downgrade_x_to_six_bump();
            NodeRC::NeedMerge
        } else {
            self.lock.unlock_x_bump();
            NodeRC::Completed
        }
    }

    unsafe fn split(&self, right: *mut Self) {
        // SAFETY: right is fresh, X-locked, and unpublished.
        let right_ref = unsafe { &*right };
        debug_assert_eq!(self.is_inner, right_ref.is_inner);
        debug_assert_eq!(self.key_len, right_ref.key_len);
        right_ref
            .pay_len
            .store(self.pay_len.load(RELAXED), RELAXED);

        let count = self.count();
        debug_assert!(count >= 2, "split of a node with fewer than two records");
        let moved_from = count / 2;
        let moved = count - moved_from;
        let rec_len = self.rec_len();

        // Preparation under SIX: the right node is not yet reachable.
        // SAFETY: both ranges in-block; right is exclusively ours.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot_ptr(moved_from),
                right_ref.block_ptr(),
                moved * rec_len,
            );
        }
        right_ref.record_count.store(moved as u16, WRITE_ORD);
        if let Some(high) = self.high_key() {
            right_ref.install_high_key(high);
        }
        right_ref.next.store(self.next.load(READ_ORD), WRITE_ORD);
        right_ref.lock.set_smo();

        // Commit under X.
        self.lock.upgrade_six_to_x();
        self.record_count.store(moved_from as u16, WRITE_ORD);
        self.install_high_key(right_ref.key_at(0));
        self.next.store(right, WRITE_ORD);
    }

    unsafe fn valid_split_node(node: *mut Self, right: *mut Self, key: &[u8]) -> *mut Self {
        // SAFETY: both halves are live and X-locked by the caller.
        let (left_ref, right_ref) = unsafe { (&*node, &*right) };
        let Some(sep) = left_ref.high_key() else {
            unreachable!("a split leaves the separator as the left half's high key")
        };
        if C::compare(key, sep) == CmpOrdering::Less {
            right_ref.lock.unlock_x();
            node
        } else {
            left_ref.lock.unlock_x_bump();
            right
        }
    }

    unsafe fn merge(&self, right: *mut Self) {
        self.lock.upgrade_six_to_x();
        // SAFETY: right is live and SIX-held by the caller.
        let right_ref = unsafe { &*right };
        right_ref.lock.upgrade_six_to_x();

        let count = self.count();
        let r_count = right_ref.count();
        let rec_len = self.rec_len();
        debug_assert!(count + r_count <= self.capacity());
        // SAFETY: both ranges in-block; both nodes X-locked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                right_ref.block_ptr(),
                self.slot_ptr(count),
                r_count * rec_len,
            );
        }
        self.record_count.store((count + r_count) as u16, WRITE_ORD);

        match right_ref.high_key() {
            Some(high) => self.install_high_key(high),
            None => self.has_high_key.store(0, WRITE_ORD),
        }
        self.next.store(right_ref.next.load(READ_ORD), WRITE_ORD);

        right_ref.lock.mark_deleted();
        self.lock.unlock_x_bump();
        right_ref.lock.unlock_x_bump();
    }

    unsafe fn get_mergeable_sibling(&self) -> Option<*mut Self> {
        let next = self.next.load(READ_ORD);
        if next.is_null() {
            self.lock.unlock_six();
            return None;
        }
        // SAFETY: next is pinned by the caller's epoch guard and cannot be
        // retired while we hold SIX (unlinking it needs X on us).
        let next_ref = unsafe { &*next };
        if !next_ref.lock.try_lock_six() {
            self.lock.unlock_six();
            return None;
        }
        if next_ref.lock.is_smo() || self.live_size() + next_ref.live_size() > MAX_MERGED_SIZE {
            next_ref.lock.unlock_six();
            self.lock.unlock_six();
            return None;
        }
        Some(next)
    }

    unsafe fn insert_child(&self, right: *mut Self, sep_key: &[u8]) -> NodeRC {
        let (found, pos) = self.search_routing(sep_key);
        if found {
            // A racing merge has not removed this separator yet.
            self.lock.unlock_x();
            return NodeRC::NeedRetry;
        }
        if self.count() >= self.capacity() {
            return NodeRC::NeedSplit;
        }
        self.shift_up(pos);
        self.write_slot(pos, sep_key, right);
        self.lock.unlock_x_bump();
        NodeRC::Completed
    }

    fn delete_child(&self, sep_key: &[u8]) -> NodeRC {
        let (found, pos) = self.search_routing(sep_key);
        if !found {
            // The separator moved or vanished under a racing SMO.
            self.lock.unlock_x();
            return NodeRC::AbortMerge;
        }
        self.shift_down(pos);

        if self.used_size() < MIN_USED_SPACE {
            self.lock.downgrade_x_to_six_bump();
            NodeRC::NeedMerge
        } else {
            self.lock.unlock_x_bump();
            NodeRC::Completed
        }
    }

    unsafe fn remove_root(node: *mut Self) -> *mut Self {
        // SAFETY: node is live and SIX-held by the caller.
        let node_ref = unsafe { &*node };
        debug_assert!(node_ref.is_inner() && node_ref.count() == 1);
        let child = node_ref.payload_at::<*mut Self>(0);
        // A blocking SIX here could deadlock against a merge that holds
        // SIX on the child while waiting for X on us; back out instead.
        // SAFETY: child is pinned by the caller's epoch guard.
        if !unsafe { (*child).lock.try_lock_six() } {
            return std::ptr::null_mut();
        }
        node_ref.lock.upgrade_six_to_x();
        node_ref.lock.mark_deleted();
        node_ref.lock.unlock_x_bump();
        child
    }

    fn search_begin_position(&self, begin: Option<&ScanBound<'_>>) -> usize {
        match begin {
            None => 0,
            Some(bound) => {
                let (found, pos) = self.search(bound.key);
                if found && !bound.inclusive {
                    pos + 1
                } else {
                    pos
                }
            }
        }
    }

    fn search_end_position(&self, end: Option<&ScanBound<'_>>) -> (bool, usize) {
        let count = self.count();
        match end {
            None => (self.next.load(READ_ORD).is_null(), count),
            Some(bound) => {
                if let Some(high) = self.high_key() {
                    if C::compare(bound.key, high) != CmpOrdering::Less {
                        return (false, count);
                    }
                }
                let (found, pos) = self.search(bound.key);
                let end_pos = if found && bound.inclusive { pos + 1 } else { pos };
                (true, end_pos)
            }
        }
    }

    unsafe fn next_for_read(node: *mut Self) -> *mut Self {
        // SAFETY: node is live and S-locked by the caller.
        let node_ref = unsafe { &*node };
        let next = node_ref.next.load(READ_ORD);
        debug_assert!(!next.is_null(), "sibling hop past the last node");
        // SAFETY: next is pinned by the iterator's epoch guard.
        unsafe { (*next).lock.lock_s() };
        node_ref.lock.unlock_s();
        next
    }

    fn bulk_push<P: Copy>(&self, key: &[u8], payload: P) -> bool {
        let count = self.count();
        if count >= self.bulk_capacity() {
            return false;
        }
        debug_assert!(count == 0 || C::lt(self.key_at(count - 1), key));
        self.write_slot(count, key, payload);
        self.record_count.store(count as u16 + 1, WRITE_ORD);
        true
    }

    fn set_next(&self, next: *mut Self) {
        self.next.store(next, WRITE_ORD);
    }

    fn set_high_key(&self, key: &[u8]) {
        self.install_high_key(key);
    }

    fn remove_leftmost_key(&self) {
        if self.count() == 0 {
            return;
        }
        // Slot 0's key is never compared; zero it for hygiene.
        // SAFETY: in-block exclusive write during bulk construction.
        unsafe { std::ptr::write_bytes(self.slot_ptr(0), 0, self.key_len as usize) };
    }
}

// ============================================================================
//  Tests
// ============================================================================
