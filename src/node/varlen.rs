//! Variable-length record layout.
//!
//! The page is split into a header, an array of slot descriptors growing up
//! from the block start, and a record heap growing down from the block end:
//!
//! ```text
//! | header | meta[0] meta[1] ... ->        ...        <- rec rec rec |
//! ```
//!
//! Slot descriptors are ordered by key; heap records sit wherever they were
//! appended. Deletion tombstones the descriptor and accounts the record
//! bytes in `deleted_size`; compaction reclaims both when an insert runs
//! out of room. The high key lives in the heap like a record, addressed by
//! its own descriptor, with [`MAX_KEY_LEN`] bytes of the block permanently
//! reserved so a split can always install a fresh one.
//!
//! # Concurrency
//!
//! The version word is the first field. Header counters and slot
//! descriptors are read through atomics, so optimistic readers observe
//! stale-but-whole values; raw key/payload bytes may be read mid-overwrite,
//! which version validation detects and discards. All writes happen under
//! the lock states documented on [`NodeLayout`].

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU64};

use crate::compare::KeyComp;
use crate::node::{
    InsertRc, MAX_KEY_LEN, MAX_MERGED_SIZE, META_LEN, MIN_FREE_SPACE, MIN_USED_SPACE, Metadata,
    NodeLayout, NodeRC, ReadRc, ScanBound,
};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::page::{PAGE_SIZE, Page};
use crate::version::VersionLock;

/// Header bytes preceding the data block.
const HEADER_LEN: usize = 32;

/// Data block bytes (descriptors + heap).
const BLOCK_SIZE: usize = PAGE_SIZE - HEADER_LEN;

/// Upper bound on slot count, used to size compaction scratch space.
const MAX_SLOTS: usize = BLOCK_SIZE / META_LEN;

// ============================================================================
//  NodeVarLen
// ============================================================================

/// A page-resident node with variable-length keys.
#[repr(C)]
pub struct NodeVarLen<C: KeyComp> {
    /// Version-and-lock word. Must stay the first field.
    lock: VersionLock,

    /// Right sibling at the same level.
    next: AtomicPtr<NodeVarLen<C>>,

    /// Node kind; written once at init, before publication.
    is_inner: u16,

    /// Slot count, including tombstones.
    record_count: AtomicU16,

    /// Heap bytes in use (records + high key), measured from the block end.
    block_size: AtomicU16,

    /// Bytes reclaimable by compaction: dead heap bytes plus the
    /// descriptors of tombstoned slots still in the array.
    deleted_size: AtomicU16,

    /// Packed descriptor of the high key; `key_len == 0` means none.
    high_meta: AtomicU64,

    /// Descriptor array and record heap.
    block: UnsafeCell<[u8; BLOCK_SIZE]>,

    _comp: PhantomData<C>,
}

impl<C: KeyComp> NodeVarLen<C> {
    const LAYOUT_CHECK: () = {
        assert!(std::mem::size_of::<Self>() == PAGE_SIZE);
        assert!(std::mem::align_of::<Self>() == 8);
    };

    // ========================================================================
    //  Raw block access
    // ========================================================================

    #[inline]
    fn block_ptr(&self) -> *mut u8 {
        self.block.get().cast()
    }

    /// Load the descriptor of slot `pos`.
    ///
    /// Descriptors are read atomically, so a concurrent rewrite yields a
    /// stale-but-whole value whose offsets still point inside the block.
    #[inline]
    fn meta(&self, pos: usize) -> Metadata {
        debug_assert!(pos < MAX_SLOTS);
        // SAFETY: pos * META_LEN is within the block and 8-aligned (the
        // block starts at offset HEADER_LEN of an 8-aligned struct).
        let slot = unsafe { &*self.block_ptr().add(pos * META_LEN).cast::<AtomicU64>() };
        Metadata::unpack(slot.load(RELAXED))
    }

    /// Store the descriptor of slot `pos`. Caller holds X.
    #[inline]
    fn set_meta(&self, pos: usize, meta: Metadata) {
        debug_assert!(pos < MAX_SLOTS);
        // SAFETY: as in `meta`.
        let slot = unsafe { &*self.block_ptr().add(pos * META_LEN).cast::<AtomicU64>() };
        slot.store(meta.pack(), RELAXED);
    }

    /// Borrow the key bytes a descriptor addresses.
    ///
    /// The returned bytes may be concurrently overwritten when the caller
    /// holds no lock; optimistic callers must validate the version before
    /// trusting a comparison made through this slice.
    #[inline]
    fn key_bytes(&self, meta: Metadata) -> &[u8] {
        debug_assert!(meta.offset as usize + meta.key_len as usize <= BLOCK_SIZE);
        // SAFETY: descriptors only ever hold in-block ranges, and the page
        // outlives every epoch-guarded reader.
        unsafe {
            std::slice::from_raw_parts(
                self.block_ptr().add(meta.offset as usize),
                meta.key_len as usize,
            )
        }
    }

    #[inline]
    fn payload_ptr(&self, meta: Metadata) -> *mut u8 {
        // SAFETY: in-block range as above.
        unsafe {
            self.block_ptr()
                .add(meta.offset as usize + meta.key_len as usize)
        }
    }

    #[inline]
    fn high_meta(&self) -> Metadata {
        Metadata::unpack(self.high_meta.load(READ_ORD))
    }

    /// Borrow the high key, if any. Stable only under a lock.
    #[inline]
    fn high_key(&self) -> Option<&[u8]> {
        let meta = self.high_meta();
        (meta.key_len != 0).then(|| self.key_bytes(meta))
    }

    // ========================================================================
    //  Space accounting
    // ========================================================================

    #[inline]
    fn count(&self) -> usize {
        self.record_count.load(READ_ORD) as usize
    }

    /// Free bytes available to record inserts, honoring the permanent
    /// high-key reserve. Negative when the reserve has been dipped into by
    /// a high-key rewrite awaiting compaction.
    #[inline]
    fn free_space(&self, extra_slots: usize) -> isize {
        let meta_bytes = (self.count() + extra_slots) * META_LEN;
        BLOCK_SIZE as isize
            - MAX_KEY_LEN as isize
            - meta_bytes as isize
            - self.block_size.load(RELAXED) as isize
    }

    /// Physical gap between the descriptor array and the heap.
    #[inline]
    fn physical_free(&self) -> isize {
        BLOCK_SIZE as isize
            - (self.count() * META_LEN) as isize
            - self.block_size.load(RELAXED) as isize
    }

    /// Content bytes (descriptors + live records + high key); excludes the
    /// header. Used for merge-fit decisions.
    #[inline]
    fn live_size(&self) -> usize {
        self.count() * META_LEN + self.block_size.load(RELAXED) as usize
            - self.deleted_size.load(RELAXED) as usize
    }

    /// Allocate `len` heap bytes; returns the new record offset.
    /// Caller holds X (or exclusive access) and has checked space.
    #[inline]
    fn heap_alloc(&self, len: usize) -> u16 {
        let new_size = self.block_size.load(RELAXED) + len as u16;
        self.block_size.store(new_size, RELAXED);
        (BLOCK_SIZE - new_size as usize) as u16
    }

    /// Write a record's bytes at a fresh heap offset. Caller holds X.
    fn append_record_bytes<P: Copy>(&self, key: &[u8], payload: P) -> Metadata {
        let pay_len = std::mem::size_of::<P>();
        let offset = self.heap_alloc(key.len() + pay_len);
        // SAFETY: offset..offset+rec_len is in-block; exclusive writer.
        unsafe {
            let dst = self.block_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(key.as_ptr(), dst, key.len());
            std::ptr::write_unaligned(dst.add(key.len()).cast::<P>(), payload);
        }
        Metadata {
            offset,
            key_len: key.len() as u16,
            rec_len: (key.len() + pay_len) as u16,
            deleted: false,
        }
    }

    /// Make room for `heap_need` record bytes plus `extra_slots`
    /// descriptors, compacting if tombstoned space can cover the deficit.
    /// Returns false when only a split can help.
    fn ensure_space(&self, heap_need: usize, extra_slots: usize) -> bool {
        if self.free_space(extra_slots) >= heap_need as isize {
            return true;
        }
        let reclaimable = self.deleted_size.load(RELAXED) as isize;
        if self.free_space(extra_slots) + reclaimable >= heap_need as isize {
            self.compact();
            return true;
        }
        false
    }

    /// Rewrite the node with tombstones and dead heap bytes dropped.
    /// Caller holds X (or exclusive access).
    fn compact(&self) {
        let count = self.count();
        let mut scratch = [0u8; BLOCK_SIZE];
        let mut metas = [Metadata {
            offset: 0,
            key_len: 0,
            rec_len: 0,
            deleted: false,
        }; MAX_SLOTS];

        let mut new_size = 0usize;
        let mut live = 0usize;
        for pos in 0..count {
            let meta = self.meta(pos);
            if meta.deleted {
                continue;
            }
            new_size += meta.rec_len as usize;
            let offset = BLOCK_SIZE - new_size;
            // SAFETY: both ranges are in-bounds; exclusive writer.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.block_ptr().add(meta.offset as usize),
                    scratch.as_mut_ptr().add(offset),
                    meta.rec_len as usize,
                );
            }
            metas[live] = Metadata {
                offset: offset as u16,
                ..meta
            };
            live += 1;
        }

        let old_high = self.high_meta();
        let new_high = if old_high.key_len != 0 {
            new_size += old_high.rec_len as usize;
            let offset = BLOCK_SIZE - new_size;
            // SAFETY: in-bounds as above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.block_ptr().add(old_high.offset as usize),
                    scratch.as_mut_ptr().add(offset),
                    old_high.rec_len as usize,
                );
            }
            Metadata {
                offset: offset as u16,
                ..old_high
            }
        } else {
            old_high
        };

        // SAFETY: writing the rebuilt heap back into the block; concurrent
        // optimistic readers may observe the mix, which version validation
        // rejects after our commit.
        unsafe {
            std::ptr::copy_nonoverlapping(
                scratch.as_ptr().add(BLOCK_SIZE - new_size),
                self.block_ptr().add(BLOCK_SIZE - new_size),
                new_size,
            );
        }
        for (pos, meta) in metas.iter().take(live).enumerate() {
            self.set_meta(pos, *meta);
        }
        self.high_meta.store(new_high.pack(), WRITE_ORD);
        self.record_count.store(live as u16, WRITE_ORD);
        self.block_size.store(new_size as u16, RELAXED);
        self.deleted_size.store(0, RELAXED);
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Lower-bound search over all slots: `(found, pos)` with `pos` the
    /// first slot whose key is `>= key`.
    fn search(&self, key: &[u8]) -> (bool, usize) {
        let count = self.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match C::compare(self.key_bytes(self.meta(mid)), key) {
                CmpOrdering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < count && C::eq(self.key_bytes(self.meta(lo)), key);
        (found, lo)
    }

    /// Routing position for `key`: the greatest slot whose key is `<= key`,
    /// with slot 0's key treated as negative infinity.
    fn search_child_pos(&self, key: &[u8]) -> usize {
        let count = self.count();
        let mut lo = 1usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match C::compare(self.key_bytes(self.meta(mid)), key) {
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
            match C::compare(self.key_bytes(self.meta(mid)), key) {
                CmpOrdering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let found = lo < count && C::eq(self.key_bytes(self.meta(lo)), key);
        (found, lo)
    }

    /// Insert a descriptor at `pos`, shifting later slots right.
    /// Caller holds X and has room for one more slot.
    fn insert_meta_at(&self, pos: usize, meta: Metadata) {
        let count = self.count();
        debug_assert!(pos <= count);
        for i in (pos..count).rev() {
            self.set_meta(i + 1, self.meta(i));
        }
        self.set_meta(pos, meta);
        self.record_count.store(count as u16 + 1, WRITE_ORD);
    }

    /// Remove the descriptor at `pos`, shifting later slots left.
    /// Caller holds X.
    fn remove_meta_at(&self, pos: usize) {
        let count = self.count();
        debug_assert!(pos < count);
        for i in pos..count - 1 {
            self.set_meta(i, self.meta(i + 1));
        }
        self.record_count.store(count as u16 - 1, WRITE_ORD);
    }

    /// Install `key` as the high key, retiring the previous one.
    /// Caller holds X (or exclusive access).
    fn install_high_key(&self, key: &[u8]) {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        if self.physical_free() < key.len() as isize {
            self.compact();
        }
        let old = self.high_meta();
        if old.key_len != 0 {
            self.deleted_size
                .store(self.deleted_size.load(RELAXED) + old.rec_len, RELAXED);
        }
        let offset = self.heap_alloc(key.len());
        // SAFETY: freshly allocated in-block range; exclusive writer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                self.block_ptr().add(offset as usize),
                key.len(),
            );
        }
        let meta = Metadata {
            offset,
            key_len: key.len() as u16,
            rec_len: key.len() as u16,
            deleted: false,
        };
        self.high_meta.store(meta.pack(), WRITE_ORD);
    }

    /// Verify intra-node invariants. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn debug_assert_invariants(&self) {
        let count = self.count();
        for pos in 1..count {
            assert!(
                C::lt(
                    self.key_bytes(self.meta(pos - 1)),
                    self.key_bytes(self.meta(pos))
                ),
                "slot keys out of order at {pos}"
            );
        }
        if let Some(high) = self.high_key() {
            if count > 0 {
                let last = self.meta(count - 1);
                assert!(
                    C::lt(self.key_bytes(last), high),
                    "high key not above the last slot"
                );
            }
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
unsafe impl<C: KeyComp> NodeLayout<C> for NodeVarLen<C> {
    unsafe fn init(page: *mut Page, is_inner: bool, _key_len: u16) -> *mut Self {
        let _: () = Self::LAYOUT_CHECK;
        let node: *mut Self = page.cast();
        // SAFETY: the page is zeroed and exclusively owned; field writes
        // imprint the header, the zeroed block is a valid empty state.
        unsafe {
            (&raw mut (*node).lock).write(VersionLock::new());
            (&raw mut (*node).next).write(AtomicPtr::new(std::ptr::null_mut()));
            (&raw mut (*node).is_inner).write(u16::from(is_inner));
            (&raw mut (*node).record_count).write(AtomicU16::new(0));
            (&raw mut (*node).block_size).write(AtomicU16::new(0));
            (&raw mut (*node).deleted_size).write(AtomicU16::new(0));
            (&raw mut (*node).high_meta).write(AtomicU64::new(0));
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
        // SAFETY: the node is unpublished; plain appends are exclusive.
        let node_ref = unsafe { &*node };
        let meta_l = node_ref.append_record_bytes(&[], left);
        node_ref.set_meta(0, meta_l);
        let meta_r = node_ref.append_record_bytes(sep_key, right);
        node_ref.set_meta(1, meta_r);
        node_ref.record_count.store(2, WRITE_ORD);
        node
    }

    fn set_payload_length(&self, _pay_len: u16) {
        // Payload length is carried per call in this layout.
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
        self.key_bytes(self.meta(pos))
    }

    fn record_is_deleted(&self, pos: usize) -> bool {
        self.meta(pos).deleted
    }

    fn payload_at<P: Copy>(&self, pos: usize) -> P {
        debug_assert!(pos < self.count());
        // SAFETY: in-block pointer; caller holds a lock, so the record is
        // stable for the read.
        unsafe { std::ptr::read_unaligned(self.payload_ptr(self.meta(pos)).cast::<P>()) }
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
            // Range check: hop right while the key is past our high key.
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
                let meta = node_ref.meta(pos);
                if meta.deleted {
                    ReadRc::NotFound
                } else {
                    // SAFETY: in-block read; a torn value fails validation.
                    let payload =
                        unsafe { std::ptr::read_unaligned(node_ref.payload_ptr(meta).cast::<P>()) };
                    ReadRc::Found(payload)
                }
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
                    // Lock-coupling: take the sibling before releasing.
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
            let meta = self.meta(pos);
            if meta.deleted {
                // Same key, same lengths: resurrect in place.
                // SAFETY: in-block write under X.
                unsafe { std::ptr::write_unaligned(self.payload_ptr(meta).cast::<P>(), payload) };
                self.set_meta(pos, Metadata {
                    deleted: false,
                    ..meta
                });
                self.deleted_size.store(
                    self.deleted_size.load(RELAXED) - meta.rec_len - META_LEN as u16,
                    RELAXED,
                );
            } else {
                // SAFETY: in-block write under X; payload length is fixed.
                unsafe { std::ptr::write_unaligned(self.payload_ptr(meta).cast::<P>(), payload) };
            }
            self.lock.unlock_x_bump();
            return NodeRC::Completed;
        }

        if !self.ensure_space(key.len() + std::mem::size_of::<P>(), 1) {
            return NodeRC::NeedSplit;
        }
        // ensure_space may have compacted; re-derive the slot position.
        let (_, pos) = self.search(key);
        let meta = self.append_record_bytes(key, payload);
        self.insert_meta_at(pos, meta);
        self.lock.unlock_x_bump();
        NodeRC::Completed
    }

    fn insert<P: Copy>(&self, key: &[u8], payload: P) -> InsertRc<P> {
        let (found, pos) = self.search(key);
        if found {
            let meta = self.meta(pos);
            if !meta.deleted {
                let existing = self.payload_at::<P>(pos);
                let version = self.lock.current_version();
                self.lock.unlock_x();
                return InsertRc::KeyPresent {
                    payload: existing,
                    version,
                };
            }
            // SAFETY: in-block write under X.
            unsafe { std::ptr::write_unaligned(self.payload_ptr(meta).cast::<P>(), payload) };
            self.set_meta(pos, Metadata {
                deleted: false,
                ..meta
            });
            self.deleted_size.store(
                self.deleted_size.load(RELAXED) - meta.rec_len - META_LEN as u16,
                RELAXED,
            );
            return InsertRc::Done(self.lock.unlock_x_bump());
        }

        if !self.ensure_space(key.len() + std::mem::size_of::<P>(), 1) {
            return InsertRc::NeedSplit;
        }
        let (_, pos) = self.search(key);
        let meta = self.append_record_bytes(key, payload);
        self.insert_meta_at(pos, meta);
        InsertRc::Done(self.lock.unlock_x_bump())
    }

    fn update<P: Copy>(&self, key: &[u8], payload: P) -> NodeRC {
        let (found, pos) = self.search(key);
        if !found || self.meta(pos).deleted {
            self.lock.unlock_x();
            return NodeRC::KeyNotPresent;
        }
        let meta = self.meta(pos);
        // SAFETY: in-block write under X; payload length is fixed.
        unsafe { std::ptr::write_unaligned(self.payload_ptr(meta).cast::<P>(), payload) };
        self.lock.unlock_x_bump();
        NodeRC::Completed
    }

    fn delete(&self, key: &[u8]) -> NodeRC {
        let (found, pos) = self.search(key);
        if !found || self.meta(pos).deleted {
            self.lock.unlock_x();
            return NodeRC::KeyNotPresent;
        }
        let meta = self.meta(pos);
        self.set_meta(pos, Metadata {
            deleted: true,
            ..meta
        });
        self.deleted_size.store(
            self.deleted_size.load(RELAXED) + meta.rec_len + META_LEN as u16,
            RELAXED,
        );

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

        let count = self.count();
        let mut live_slots = [0usize; MAX_SLOTS];
        let mut live = 0usize;
        for pos in 0..count {
            if !self.meta(pos).deleted {
                live_slots[live] = pos;
                live += 1;
            }
        }
        debug_assert!(live >= 2, "split of a node with fewer than two records");

        // The slot where the right half begins (clamped so both halves
        // keep at least one live record).
        let moved_from = live_slots[live / 2];

        // Preparation phase, under SIX: build the right node from our upper
        // half. Readers of `self` proceed; `right` is not yet reachable.
        let mut r_count = 0usize;
        for &pos in &live_slots[..live] {
            if pos < moved_from {
                continue;
            }
            let meta = self.meta(pos);
            let new_offset = right_ref.heap_alloc(meta.rec_len as usize);
            // SAFETY: both ranges in-block; right is exclusively ours.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.block_ptr().add(meta.offset as usize),
                    right_ref.block_ptr().add(new_offset as usize),
                    meta.rec_len as usize,
                );
            }
            right_ref.set_meta(r_count, Metadata {
                offset: new_offset,
                ..meta
            });
            r_count += 1;
        }
        right_ref.record_count.store(r_count as u16, WRITE_ORD);
        if let Some(high) = self.high_key() {
            right_ref.install_high_key(high);
        }
        right_ref.next.store(self.next.load(READ_ORD), WRITE_ORD);
        right_ref.lock.set_smo();

        // Commit phase: cut ourselves down under X.
        self.lock.upgrade_six_to_x();

        let l_live_bytes: usize = live_slots[..live]
            .iter()
            .filter(|&&pos| pos < moved_from)
            .map(|&pos| self.meta(pos).rec_len as usize)
            .sum();
        let tombstone_meta_bytes: usize = (0..moved_from)
            .filter(|&pos| self.meta(pos).deleted)
            .count()
            * META_LEN;
        let old_high_len = self.high_meta().rec_len as usize;
        self.record_count.store(moved_from as u16, WRITE_ORD);
        // Everything in the heap except the lower-half records and the old
        // high key is now dead, as are the descriptors of the tombstones
        // that stayed behind.
        let dead = self.block_size.load(RELAXED) as usize - l_live_bytes - old_high_len
            + tombstone_meta_bytes;
        self.deleted_size.store(dead as u16, RELAXED);
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
            // Keep the left half; the untouched right unlocks plain.
            right_ref.lock.unlock_x();
            node
        } else {
            // The left half was restructured; its release must commit.
            left_ref.lock.unlock_x_bump();
            right
        }
    }

    unsafe fn merge(&self, right: *mut Self) {
        self.lock.upgrade_six_to_x();
        // SAFETY: right is live and SIX-held by the caller.
        let right_ref = unsafe { &*right };
        right_ref.lock.upgrade_six_to_x();

        let r_count = right_ref.count();
        let mut appended = self.count();
        for pos in 0..r_count {
            let meta = right_ref.meta(pos);
            if meta.deleted {
                continue;
            }
            if !self.ensure_space(meta.rec_len as usize, 1) {
                unreachable!("merge fit was checked by the mergeability probe");
            }
            let new_offset = self.heap_alloc(meta.rec_len as usize);
            // SAFETY: both ranges in-block; both nodes X-locked.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    right_ref.block_ptr().add(meta.offset as usize),
                    self.block_ptr().add(new_offset as usize),
                    meta.rec_len as usize,
                );
            }
            self.set_meta(appended, Metadata {
                offset: new_offset,
                ..meta
            });
            appended += 1;
            self.record_count.store(appended as u16, WRITE_ORD);
        }

        match right_ref.high_key() {
            Some(high) => self.install_high_key(high),
            None => {
                let old = self.high_meta();
                if old.key_len != 0 {
                    self.deleted_size
                        .store(self.deleted_size.load(RELAXED) + old.rec_len, RELAXED);
                }
                self.high_meta.store(0, WRITE_ORD);
            }
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
        if !self.ensure_space(sep_key.len() + std::mem::size_of::<*mut Self>(), 1) {
            return NodeRC::NeedSplit;
        }
        let (_, pos2) = self.search_routing(sep_key);
        debug_assert!(pos2 >= 1 || pos == pos2);
        let meta = self.append_record_bytes(sep_key, right);
        self.insert_meta_at(pos2, meta);
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
        let meta = self.meta(pos);
        self.remove_meta_at(pos);
        self.deleted_size
            .store(self.deleted_size.load(RELAXED) + meta.rec_len, RELAXED);

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
                        // The whole node is inside the range.
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
        // SAFETY: node is live and S-locked by the caller, which keeps the
        // sibling pointer stable.
        let node_ref = unsafe { &*node };
        let next = node_ref.next.load(READ_ORD);
        debug_assert!(!next.is_null(), "sibling hop past the last node");
        // SAFETY: next is pinned by the iterator's epoch guard.
        unsafe { (*next).lock.lock_s() };
        node_ref.lock.unlock_s();
        next
    }

    fn bulk_push<P: Copy>(&self, key: &[u8], payload: P) -> bool {
        let need = key.len() + std::mem::size_of::<P>();
        if self.free_space(1) - (MIN_FREE_SPACE as isize) < need as isize {
            return false;
        }
        debug_assert!(self.count() == 0 || C::lt(self.key_at(self.count() - 1), key));
        let meta = self.append_record_bytes(key, payload);
        let count = self.count();
        self.set_meta(count, meta);
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
        let meta = self.meta(0);
        if meta.key_len == 0 {
            return;
        }
        // The key bytes become dead heap space; the payload remains live.
        self.deleted_size
            .store(self.deleted_size.load(RELAXED) + meta.key_len, RELAXED);
        self.set_meta(0, Metadata {
            offset: meta.offset + meta.key_len,
            key_len: 0,
            rec_len: meta.rec_len - meta.key_len,
            deleted: meta.deleted,
        });
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::Lexicographic;
    use crate::page::{alloc_page, release_page};

    type Node = NodeVarLen<Lexicographic>;

    struct PageGuard(*mut Page);

    impl Drop for PageGuard {
        fn drop(&mut self) {
            // SAFETY: allocated by the test, released once.
            unsafe { release_page(self.0) };
        }
    }

    fn leaf() -> (PageGuard, *mut Node) {
        let page = alloc_page();
        // SAFETY: fresh zeroed page.
        let node = unsafe { Node::init(page, false, 8) };
        (PageGuard(page), node)
    }

    fn key(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    fn locked_insert(node: &Node, k: u64, v: u64) -> InsertRc<u64> {
        node.lock().lock_x();
        node.insert(&key(k), v)
    }

    fn read(node: *mut Node, k: u64) -> ReadRc<u64> {
        // SAFETY: the node is alive for the test's duration.
        unsafe { Node::read::<u64>(node, &key(k)) }
    }

    #[test]
    fn test_insert_and_read() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        assert!(matches!(locked_insert(node_ref, 2, 20), InsertRc::Done(_)));
        assert!(matches!(locked_insert(node_ref, 1, 10), InsertRc::Done(_)));
        assert!(matches!(locked_insert(node_ref, 3, 30), InsertRc::Done(_)));

        assert_eq!(read(node, 1), ReadRc::Found(10));
        assert_eq!(read(node, 2), ReadRc::Found(20));
        assert_eq!(read(node, 3), ReadRc::Found(30));
        assert_eq!(read(node, 4), ReadRc::NotFound);
        node_ref.debug_assert_invariants();
    }

    #[test]
    fn test_insert_existing_reports_payload_and_version() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        let InsertRc::Done(v1) = locked_insert(node_ref, 7, 70) else {
            panic!("first insert must succeed");
        };
        match locked_insert(node_ref, 7, 71) {
            InsertRc::KeyPresent { payload, version } => {
                assert_eq!(payload, 70);
                assert_eq!(version, v1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(read(node, 7), ReadRc::Found(70));
    }

    #[test]
    fn test_write_overwrites() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        node_ref.lock().lock_x();
        assert_eq!(node_ref.write(&key(5), 50u64), NodeRC::Completed);
        node_ref.lock().lock_x();
        assert_eq!(node_ref.write(&key(5), 51u64), NodeRC::Completed);
        assert_eq!(read(node, 5), ReadRc::Found(51));
        assert_eq!(node_ref.record_count(), 1);
    }

    #[test]
    fn test_delete_tombstones_and_insert_resurrects() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        locked_insert(node_ref, 1, 10);
        locked_insert(node_ref, 2, 20);

        node_ref.lock().lock_x();
        let rc = node_ref.delete(&key(1));
        assert!(rc == NodeRC::Completed || rc == NodeRC::NeedMerge);
        if rc == NodeRC::NeedMerge {
            node_ref.lock().unlock_six();
        }
        assert_eq!(read(node, 1), ReadRc::NotFound);
        assert!(node_ref.record_is_deleted(0));

        // Tombstoned slot resurrects in place.
        assert!(matches!(locked_insert(node_ref, 1, 11), InsertRc::Done(_)));
        assert_eq!(read(node, 1), ReadRc::Found(11));
        assert!(!node_ref.record_is_deleted(0));
    }

    #[test]
    fn test_delete_missing_key() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        node_ref.lock().lock_x();
        assert_eq!(node_ref.delete(&key(9)), NodeRC::KeyNotPresent);
        assert!(!node_ref.lock().is_locked());
    }

    #[test]
    fn test_update_paths() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        node_ref.lock().lock_x();
        assert_eq!(node_ref.update(&key(1), 99u64), NodeRC::KeyNotPresent);

        locked_insert(node_ref, 1, 10);
        node_ref.lock().lock_x();
        assert_eq!(node_ref.update(&key(1), 11u64), NodeRC::Completed);
        assert_eq!(read(node, 1), ReadRc::Found(11));
    }

    #[test]
    fn test_fill_until_split_then_split() {
        let (_pg, left) = leaf();
        let left_ref = unsafe { &*left };

        // Fill until the node reports NeedSplit.
        let mut filled = 0u64;
        loop {
            match locked_insert(left_ref, filled, filled) {
                InsertRc::Done(_) => filled += 1,
                InsertRc::NeedSplit => break,
                InsertRc::KeyPresent { .. } => panic!("keys are unique"),
            }
        }
        assert!(filled > 10, "a page should hold more than ten records");

        // NeedSplit left X held; run the split ladder.
        left_ref.lock().downgrade_x_to_six();
        let (_pg_r, right) = {
            let page = alloc_page();
            let right = unsafe { Node::init(page, false, 8) };
            unsafe { (*right).lock().lock_x() };
            (PageGuard(page), right)
        };
        unsafe { left_ref.split(right) };
        let right_ref = unsafe { &*right };

        // Separator is the right half's minimum key, left's high key.
        let mut buf = [0u8; MAX_KEY_LEN];
        let sep_len = left_ref.copy_high_key_into(&mut buf).unwrap();
        assert_eq!(&buf[..sep_len], right_ref.key_at(0));
        assert_eq!(left_ref.next(), right);
        assert!(right_ref.lock().is_smo());

        // The pending insert lands in the right half here.
        let target = unsafe { Node::valid_split_node(left, right, &key(filled)) };
        assert_eq!(target, right);
        assert!(matches!(
            unsafe { &*target }.insert(&key(filled), filled),
            InsertRc::Done(_)
        ));

        // Every record is still readable through the sibling chain.
        for i in 0..=filled {
            assert_eq!(read(left, i), ReadRc::Found(i));
        }
        left_ref.debug_assert_invariants();
        right_ref.debug_assert_invariants();
    }

    #[test]
    fn test_merge_right_into_left() {
        let (_pg_l, left) = leaf();
        let (_pg_r, right) = {
            let page = alloc_page();
            let node = unsafe { Node::init(page, false, 8) };
            (PageGuard(page), node)
        };
        let (left_ref, right_ref) = unsafe { (&*left, &*right) };

        locked_insert(left_ref, 1, 10);
        locked_insert(left_ref, 2, 20);
        locked_insert(right_ref, 5, 50);
        locked_insert(right_ref, 6, 60);
        left_ref.set_next(right);
        left_ref.set_high_key(&key(5));

        left_ref.lock().lock_six();
        let sibling = unsafe { left_ref.get_mergeable_sibling() };
        assert_eq!(sibling, Some(right));

        unsafe { left_ref.merge(right) };
        assert!(right_ref.lock().is_deleted());
        assert!(left_ref.next().is_null());
        assert_eq!(left_ref.record_count(), 4);
        for (k, v) in [(1, 10), (2, 20), (5, 50), (6, 60)] {
            assert_eq!(read(left, k), ReadRc::Found(v));
        }
        left_ref.debug_assert_invariants();
    }

    #[test]
    fn test_mergeable_probe_refuses_smo_sibling() {
        let (_pg_l, left) = leaf();
        let (_pg_r, right) = leaf();
        let (left_ref, right_ref) = unsafe { (&*left, &*right) };

        left_ref.set_next(right);
        right_ref.lock().set_smo();

        left_ref.lock().lock_six();
        assert_eq!(unsafe { left_ref.get_mergeable_sibling() }, None);
        assert!(!left_ref.lock().is_locked());
        assert!(!right_ref.lock().is_locked());
    }

    #[test]
    fn test_inner_routing_ignores_slot_zero_key() {
        let (_pg_l, left) = leaf();
        let (_pg_r, right) = leaf();

        let page = alloc_page();
        let root = unsafe { Node::init_root(page, 8, &key(100), left, right) };
        let _root_guard = PageGuard(page);
        let root_ref = unsafe { &*root };

        assert!(root_ref.is_inner());
        assert_eq!(root_ref.record_count(), 2);
        // Keys below the separator route left, at or above route right.
        let (_, child) = unsafe { Node::search_child(root, &key(1)) }.unwrap();
        assert_eq!(child, left);
        let (_, child) = unsafe { Node::search_child(root, &key(100)) }.unwrap();
        assert_eq!(child, right);
        let (_, child) = unsafe { Node::search_child(root, &key(500)) }.unwrap();
        assert_eq!(child, right);
    }

    #[test]
    fn test_insert_child_and_delete_child() {
        let (_pg_a, a) = leaf();
        let (_pg_b, b) = leaf();
        let (_pg_c, c) = leaf();

        let page = alloc_page();
        let root = unsafe { Node::init_root(page, 8, &key(100), a, b) };
        let _root_guard = PageGuard(page);
        let root_ref = unsafe { &*root };

        root_ref.lock().lock_x();
        assert_eq!(
            unsafe { root_ref.insert_child(c, &key(200)) },
            NodeRC::Completed
        );
        let (_, child) = unsafe { Node::search_child(root, &key(250)) }.unwrap();
        assert_eq!(child, c);

        // Duplicate separator: a racing merge still owns it.
        root_ref.lock().lock_x();
        assert_eq!(
            unsafe { root_ref.insert_child(c, &key(200)) },
            NodeRC::NeedRetry
        );

        // Deleting the separator reroutes its range to the left neighbor.
        root_ref.lock().lock_x();
        let rc = root_ref.delete_child(&key(200));
        assert!(rc == NodeRC::Completed || rc == NodeRC::NeedMerge);
        if rc == NodeRC::NeedMerge {
            root_ref.lock().unlock_six();
        }
        let (_, child) = unsafe { Node::search_child(root, &key(250)) }.unwrap();
        assert_eq!(child, b);

        // Unknown separator aborts the merge.
        root_ref.lock().lock_x();
        assert_eq!(root_ref.delete_child(&key(123)), NodeRC::AbortMerge);
    }

    #[test]
    fn test_compaction_reclaims_tombstones() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        // Fill the node completely.
        let mut filled = 0u64;
        loop {
            match locked_insert(node_ref, filled, filled) {
                InsertRc::Done(_) => filled += 1,
                InsertRc::NeedSplit => {
                    node_ref.lock().unlock_x();
                    break;
                }
                InsertRc::KeyPresent { .. } => unreachable!(),
            }
        }

        // Tombstone the first half, then insert fresh keys: compaction
        // must make the space usable without a split.
        for i in 0..filled / 2 {
            node_ref.lock().lock_x();
            let rc = node_ref.delete(&key(i));
            assert!(rc == NodeRC::Completed || rc == NodeRC::NeedMerge);
            if rc == NodeRC::NeedMerge {
                node_ref.lock().unlock_six();
            }
        }
        for i in 0..filled / 4 {
            assert!(
                matches!(locked_insert(node_ref, 1_000_000 + i, i), InsertRc::Done(_)),
                "compaction should have made room"
            );
        }
        node_ref.debug_assert_invariants();
    }

    #[test]
    fn test_variable_length_keys_up_to_max() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };

        let long_key = vec![0xAB; MAX_KEY_LEN];
        let short_key = b"a".to_vec();
        node_ref.lock().lock_x();
        assert!(matches!(node_ref.insert(&short_key, 1u64), InsertRc::Done(_)));
        node_ref.lock().lock_x();
        assert!(matches!(node_ref.insert(&long_key, 2u64), InsertRc::Done(_)));

        assert_eq!(
            unsafe { Node::read::<u64>(node, &long_key) },
            ReadRc::Found(2)
        );
        assert_eq!(
            unsafe { Node::read::<u64>(node, &short_key) },
            ReadRc::Found(1)
        );
        node_ref.debug_assert_invariants();
    }

    #[test]
    fn test_scan_positions() {
        let (_pg, node) = leaf();
        let node_ref = unsafe { &*node };
        for i in [2u64, 4, 6, 8] {
            locked_insert(node_ref, i, i * 10);
        }

        let k4 = key(4);
        let k5 = key(5);
        let k6 = key(6);
        fn closed(k: &[u8]) -> ScanBound<'_> {
            ScanBound {
                key: k,
                inclusive: true,
            }
        }
        fn open(k: &[u8]) -> ScanBound<'_> {
            ScanBound {
                key: k,
                inclusive: false,
            }
        }
        assert_eq!(node_ref.search_begin_position(None), 0);
        assert_eq!(node_ref.search_begin_position(Some(&closed(&k4))), 1);
        assert_eq!(node_ref.search_begin_position(Some(&open(&k4))), 2);
        assert_eq!(node_ref.search_begin_position(Some(&closed(&k5))), 2);

        // Rightmost node: every end bound terminates here.
        let (is_end, end_pos) = node_ref.search_end_position(None);
        assert!(is_end);
        assert_eq!(end_pos, 4);
        let (is_end, end_pos) = node_ref.search_end_position(Some(&closed(&k6)));
        assert!(is_end);
        assert_eq!(end_pos, 3);
        let (_, end_pos) = node_ref.search_end_position(Some(&open(&k6)));
        assert_eq!(end_pos, 2);
    }

    #[test]
    fn test_remove_leftmost_key_strips_routing_artifact() {
        let (_pg_a, a) = leaf();
        let (_pg_b, b) = leaf();
        let page = alloc_page();
        // Bulk-built inner nodes carry a real key in slot 0.
        let inner = unsafe { Node::init(page, true, 8) };
        let _inner_guard = PageGuard(page);
        let inner_ref = unsafe { &*inner };
        assert!(inner_ref.bulk_push(&key(10), a));
        assert!(inner_ref.bulk_push(&key(20), b));
        assert_eq!(inner_ref.key_at(0), key(10).as_slice());

        inner_ref.remove_leftmost_key();
        assert_eq!(inner_ref.key_at(0).len(), 0);
        assert_eq!(unsafe { inner_ref.child_at(0) }, a);
        assert_eq!(unsafe { inner_ref.child_at(1) }, b);
        // Stripping twice is a no-op.
        inner_ref.remove_leftmost_key();
        assert_eq!(inner_ref.key_at(0).len(), 0);
    }
}
