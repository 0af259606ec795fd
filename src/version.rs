//! Version-and-lock word for optimistic node concurrency.
//!
//! [`VersionLock`] packs the lock state, metadata flags, and a monotonic
//! version counter into a single `u64`:
//!
//! ```text
//! bit 63 ........ 18 | 17 | 16 | 15 ........ 2 | 1 | 0
//!   version counter    X    SIX   shared count  SMO  deleted
//! ```
//!
//! # Concurrency model
//!
//! 1. Optimistic readers call [`VersionLock::get_version`], copy the data
//!    they need, then call [`VersionLock::has_same_version`]. A value is
//!    accepted only if the version is unchanged and no exclusive holder was
//!    present at either read.
//! 2. Writers acquire X and commit with [`VersionLock::unlock_x_bump`],
//!    which advances the counter.
//! 3. Structure modifications acquire SIX while preparing (readers still
//!    pass), then upgrade to X for the commit once shared holders drain.
//!
//! The word is manipulated through explicit `lock_*`/`unlock_*` methods
//! rather than drop guards: split and merge hand locks across functions and
//! release exactly one of two held siblings, which a scoped guard cannot
//! express.

use std::sync::atomic::AtomicU64;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

// ============================================================================
//  Bit constants
// ============================================================================

/// Deleted flag: the node has been retired from the tree.
const DELETED_BIT: u64 = 1 << 0;

/// SMO flag: a structure modification involving this node is incomplete
/// (set on a split-right node until its routing entry is installed).
const SMO_BIT: u64 = 1 << 1;

/// One shared holder.
const S_UNIT: u64 = 1 << 2;

/// Shared-holder count field (14 bits).
const S_MASK: u64 = ((1 << 14) - 1) * S_UNIT;

/// Shared-intent-exclusive bit.
const SIX_BIT: u64 = 1 << 16;

/// Exclusive bit.
const X_BIT: u64 = 1 << 17;

/// One version increment.
const VERSION_UNIT: u64 = 1 << 18;

/// Version counter field (46 bits).
const VERSION_MASK: u64 = !(VERSION_UNIT - 1);

/// Bits an optimistic snapshot observes: the counter plus the deleted flag.
/// Shared/SIX churn and the SMO flag do not invalidate readers.
const STABLE_MASK: u64 = VERSION_MASK | DELETED_BIT;

// ============================================================================
//  VersionLock
// ============================================================================

/// The per-node version-and-lock word.
#[derive(Debug)]
pub struct VersionLock {
    word: AtomicU64,
}

impl VersionLock {
    /// Create an unlocked word with version zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    // ========================================================================
    //  Optimistic validation
    // ========================================================================

    /// Take a stable version snapshot for an optimistic read.
    ///
    /// Spins while an exclusive holder is present; the returned value never
    /// has the X bit set.
    #[inline]
    #[must_use]
    pub fn get_version(&self) -> u64 {
        loop {
            let word = self.word.load(READ_ORD);
            if word & X_BIT == 0 {
                return word & STABLE_MASK;
            }
            std::hint::spin_loop();
        }
    }

    /// Read the current version snapshot without spinning.
    ///
    /// Only meaningful while the caller holds a lock that freezes the
    /// counter (X or SIX); used to report the committed version of a node.
    #[inline]
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.word.load(RELAXED) & STABLE_MASK
    }

    /// Whether a snapshot from [`Self::get_version`] carries the deleted flag.
    #[inline]
    #[must_use]
    pub const fn snapshot_deleted(snapshot: u64) -> bool {
        snapshot & DELETED_BIT != 0
    }

    /// Check that the word still matches a snapshot from [`Self::get_version`].
    ///
    /// Fails if a writer holds X right now or if any committed modification
    /// (or deletion) happened since the snapshot.
    #[inline]
    #[must_use]
    pub fn has_same_version(&self, expected: u64) -> bool {
        let word = self.word.load(READ_ORD);
        word & X_BIT == 0 && word & STABLE_MASK == expected
    }

    // ========================================================================
    //  Shared
    // ========================================================================

    /// Acquire a shared lock. Coexists with other S holders and one SIX
    /// holder; blocks while X is held.
    pub fn lock_s(&self) {
        let mut word = self.word.load(RELAXED);
        loop {
            if word & X_BIT != 0 {
                std::hint::spin_loop();
                word = self.word.load(RELAXED);
                continue;
            }
            debug_assert!(word & S_MASK != S_MASK, "shared count overflow");
            match self
                .word
                .compare_exchange_weak(word, word + S_UNIT, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    /// Release a shared lock.
    pub fn unlock_s(&self) {
        let prev = self.word.fetch_sub(S_UNIT, WRITE_ORD);
        debug_assert!(prev & S_MASK != 0, "unlock_s without a shared holder");
    }

    // ========================================================================
    //  Exclusive
    // ========================================================================

    /// Acquire the exclusive lock. Blocks while any S, SIX, or X holder is
    /// present.
    pub fn lock_x(&self) {
        let mut word = self.word.load(RELAXED);
        loop {
            if word & (X_BIT | SIX_BIT | S_MASK) != 0 {
                std::hint::spin_loop();
                word = self.word.load(RELAXED);
                continue;
            }
            match self
                .word
                .compare_exchange_weak(word, word | X_BIT, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    /// Release the exclusive lock without advancing the version.
    ///
    /// Used when nothing was modified (wrong node reached during a sibling
    /// walk, key already present, ...).
    pub fn unlock_x(&self) {
        let word = self.word.load(RELAXED);
        debug_assert!(word & X_BIT != 0, "unlock_x without the lock");
        // The X holder is the only possible writer of the word: lock_s /
        // lock_six CAS from an X-free expected value and therefore fail
        // while the bit is set, so a plain store cannot lose their updates.
        self.word.store(word & !X_BIT, WRITE_ORD);
    }

    /// Commit: advance the version and release the exclusive lock.
    ///
    /// Returns the new version snapshot (as [`Self::get_version`] would
    /// observe it).
    pub fn unlock_x_bump(&self) -> u64 {
        let word = self.word.load(RELAXED);
        debug_assert!(word & X_BIT != 0, "unlock_x_bump without the lock");
        let new = (word + VERSION_UNIT) & !X_BIT;
        self.word.store(new, WRITE_ORD);
        new & STABLE_MASK
    }

    // ========================================================================
    //  Shared-intent-exclusive
    // ========================================================================

    /// Acquire the SIX lock. Coexists with S holders; blocks while another
    /// SIX or X holder is present.
    pub fn lock_six(&self) {
        let mut word = self.word.load(RELAXED);
        loop {
            if word & (X_BIT | SIX_BIT) != 0 {
                std::hint::spin_loop();
                word = self.word.load(RELAXED);
                continue;
            }
            match self
                .word
                .compare_exchange_weak(word, word | SIX_BIT, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    /// Try to acquire the SIX lock without blocking.
    #[must_use]
    pub fn try_lock_six(&self) -> bool {
        let word = self.word.load(RELAXED);
        if word & (X_BIT | SIX_BIT) != 0 {
            return false;
        }
        self.word
            .compare_exchange(word, word | SIX_BIT, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Release the SIX lock without advancing the version.
    pub fn unlock_six(&self) {
        let prev = self.word.fetch_and(!SIX_BIT, WRITE_ORD);
        debug_assert!(prev & SIX_BIT != 0, "unlock_six without the lock");
    }

    /// Upgrade SIX to X once all shared holders drain.
    pub fn upgrade_six_to_x(&self) {
        let mut word = self.word.load(RELAXED);
        loop {
            debug_assert!(word & SIX_BIT != 0, "upgrade without SIX held");
            if word & S_MASK != 0 {
                std::hint::spin_loop();
                word = self.word.load(RELAXED);
                continue;
            }
            match self.word.compare_exchange_weak(
                word,
                (word & !SIX_BIT) | X_BIT,
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    /// Downgrade X to SIX without advancing the version.
    pub fn downgrade_x_to_six(&self) {
        let word = self.word.load(RELAXED);
        debug_assert!(word & X_BIT != 0, "downgrade without the lock");
        self.word.store((word & !X_BIT) | SIX_BIT, WRITE_ORD);
    }

    /// Commit and downgrade X to SIX in one step.
    ///
    /// Used after a delete that leaves the node underfull: the mutation is
    /// published while the holder keeps SIX for the merge probe.
    pub fn downgrade_x_to_six_bump(&self) {
        let word = self.word.load(RELAXED);
        debug_assert!(word & X_BIT != 0, "downgrade without the lock");
        self.word
            .store(((word + VERSION_UNIT) & !X_BIT) | SIX_BIT, WRITE_ORD);
    }

    // ========================================================================
    //  Flags
    // ========================================================================

    /// Check the deleted flag.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.word.load(READ_ORD) & DELETED_BIT != 0
    }

    /// Set the deleted flag. Caller holds X.
    pub fn mark_deleted(&self) {
        self.word.fetch_or(DELETED_BIT, WRITE_ORD);
    }

    /// Check the SMO-in-progress flag.
    #[inline]
    #[must_use]
    pub fn is_smo(&self) -> bool {
        self.word.load(READ_ORD) & SMO_BIT != 0
    }

    /// Set the SMO-in-progress flag.
    pub fn set_smo(&self) {
        self.word.fetch_or(SMO_BIT, WRITE_ORD);
    }

    /// Clear the SMO-in-progress flag.
    pub fn clear_smo(&self) {
        self.word.fetch_and(!SMO_BIT, WRITE_ORD);
    }

    /// Check whether any lock state is held. Test and assertion helper.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(READ_ORD) & (X_BIT | SIX_BIT | S_MASK) != 0
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
//  Tests
// ============================================================================
