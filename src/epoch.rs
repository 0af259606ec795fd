//! Epoch-based page reclamation.
//!
//! A retired page may still be referenced by in-flight optimistic readers,
//! so it cannot be freed immediately. [`EpochGc`] defers the free until
//! every actor that could have observed the pointer has left its epoch:
//!
//! 1. Every public tree operation calls [`EpochGc::enter`] before its first
//!    pointer dereference and drops the returned [`EpochGuard`] after its
//!    last.
//! 2. Structure modifications unlink a page from the tree, then hand it to
//!    [`EpochGc::retire`].
//! 3. A page retired in epoch `E` is recycled once no guard for an epoch
//!    `<= E` remains, at which point [`EpochGc::try_acquire_page`] may hand
//!    it out again.
//!
//! The epoch counter is advanced by background workers at a configured
//! interval; with zero workers, collection piggybacks on `enter`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::page::{Page, release_page};

/// Slot value while the actor is outside the tree.
const INACTIVE: u64 = u64::MAX;

// ============================================================================
//  Actor slots
// ============================================================================

/// Per-actor epoch registration.
#[derive(Debug)]
struct ActorSlot {
    /// Epoch the actor entered, or [`INACTIVE`].
    entered: AtomicU64,
}

// ============================================================================
//  Shared reclaimer state
// ============================================================================

#[derive(Debug)]
struct GcShared {
    /// Monotonic global epoch.
    epoch: AtomicU64,

    /// Every slot ever handed out; slots are reused via `free_slots`.
    actors: Mutex<Vec<Arc<ActorSlot>>>,

    /// Slots not currently owned by a guard.
    free_slots: Mutex<Vec<Arc<ActorSlot>>>,

    /// Retired pages, oldest first, tagged with their retirement epoch.
    garbage: Mutex<VecDeque<(u64, *mut Page)>>,

    /// Pages whose retirement epoch has been fully vacated; ready for reuse.
    pool: Mutex<Vec<*mut Page>>,

    /// Signals background workers to stop.
    running: AtomicBool,
}

// SAFETY: the raw page pointers in `garbage` and `pool` are exclusively
// owned by the reclaimer (retired pages are unreachable from the tree) and
// only touched under the respective Mutex.
unsafe impl Send for GcShared {}
unsafe impl Sync for GcShared {}

impl GcShared {
    /// Advance the epoch and move fully vacated garbage to the reuse pool.
    fn collect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        // The reclamation frontier: the oldest epoch any active actor may
        // still observe. With no active actors everything retired so far is
        // reclaimable.
        let frontier = {
            let actors = self.actors.lock();
            actors
                .iter()
                .map(|slot| slot.entered.load(Ordering::SeqCst))
                .min()
                .unwrap_or(INACTIVE)
        };

        let mut garbage = self.garbage.lock();
        let mut pool = self.pool.lock();
        while let Some(&(retired_at, page)) = garbage.front() {
            if retired_at >= frontier {
                break;
            }
            garbage.pop_front();
            pool.push(page);
        }
    }
}

// ============================================================================
//  EpochGc
// ============================================================================

/// The per-tree page reclaimer.
///
/// Dropping it stops the workers and frees every queued and pooled page;
/// the owning tree must already be quiescent.
#[derive(Debug)]
pub struct EpochGc {
    shared: Arc<GcShared>,
    workers: Vec<JoinHandle<()>>,
}

impl EpochGc {
    /// Start a reclaimer.
    ///
    /// # Arguments
    ///
    /// * `interval_micros` - epoch advance interval for background workers.
    /// * `worker_count` - number of background workers; `0` disables them
    ///   and collection happens on [`Self::enter`] instead.
    #[must_use]
    pub fn new(interval_micros: u64, worker_count: usize) -> Self {
        let shared = Arc::new(GcShared {
            epoch: AtomicU64::new(1),
            actors: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            garbage: Mutex::new(VecDeque::new()),
            pool: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let interval = Duration::from_micros(interval_micros);
        let workers = (0..worker_count)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    while shared.running.load(Ordering::Acquire) {
                        shared.collect();
                        std::thread::sleep(interval);
                    }
                })
            })
            .collect();

        Self { shared, workers }
    }

    /// Register the caller in the current epoch.
    ///
    /// Pages retired from this point on will not be recycled until the
    /// returned guard drops.
    #[must_use]
    pub fn enter(&self) -> EpochGuard {
        if self.workers.is_empty() {
            self.shared.collect();
        }

        let slot = self
            .shared
            .free_slots
            .lock()
            .pop()
            .unwrap_or_else(|| {
                let slot = Arc::new(ActorSlot {
                    entered: AtomicU64::new(INACTIVE),
                });
                self.shared.actors.lock().push(Arc::clone(&slot));
                slot
            });

        slot.entered
            .store(self.shared.epoch.load(Ordering::SeqCst), Ordering::SeqCst);

        EpochGuard {
            shared: Arc::clone(&self.shared),
            slot,
        }
    }

    /// Enqueue an unlinked page for deferred reclamation.
    ///
    /// The page must already be unreachable from the tree for *new*
    /// traversals; only actors whose guards predate this call may still
    /// hold the pointer, and the epoch discipline waits those out.
    pub fn retire(&self, page: *mut Page) {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.shared.garbage.lock().push_back((epoch, page));
    }

    /// Take a previously retired page that is now safe to reuse.
    ///
    /// Returns `None` when nothing is reclaimable yet; the caller falls
    /// back to a fresh allocation.
    #[must_use]
    pub fn try_acquire_page(&self) -> Option<*mut Page> {
        self.shared.pool.lock().pop()
    }

    /// Number of pages awaiting reclamation. Test helper.
    #[must_use]
    pub fn garbage_len(&self) -> usize {
        self.shared.garbage.lock().len()
    }

    /// Number of pages ready for reuse. Test helper.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.shared.pool.lock().len()
    }
}

impl Drop for EpochGc {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        // No actors remain (the tree is being destroyed), so both queues
        // hold exclusively owned pages.
        for (_, page) in self.shared.garbage.lock().drain(..) {
            // SAFETY: retired pages are unreachable and unaliased.
            unsafe { release_page(page) };
        }
        for page in self.shared.pool.lock().drain(..) {
            // SAFETY: pooled pages are unreachable and unaliased.
            unsafe { release_page(page) };
        }
    }
}

// ============================================================================
//  EpochGuard
// ============================================================================

/// A scoped epoch registration.
///
/// Holding a guard pins every page retired in or after the guard's epoch.
/// Dropping it releases the pin.
#[derive(Debug)]
pub struct EpochGuard {
    shared: Arc<GcShared>,
    slot: Arc<ActorSlot>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.slot.entered.store(INACTIVE, Ordering::SeqCst);
        self.shared.free_slots.lock().push(Arc::clone(&self.slot));
    }
}

// ============================================================================
//  Tests
// ============================================================================
