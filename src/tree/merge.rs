//! Merge completion and root shrink.
//!
//! A node that underflows after a delete keeps SIX and probes its right
//! sibling. If the pair fits, the parent's routing entry for the sibling
//! is removed first (unlinking it for new traversals), the records are
//! folded left, and the emptied page is handed to the reclaimer. When the
//! parent underflows in turn, the walk continues upward; when the stack is
//! exhausted and the root is down to one child, the root chain collapses.

use crate::compare::KeyComp;
use crate::node::{MAX_KEY_LEN, NodeLayout, NodeRC};
use crate::ordering::{CAS_FAILURE, READ_ORD, ROOT_CAS};

use super::{BPlusTree, RETRY_WAIT};

impl<V: Copy, C: KeyComp, N: NodeLayout<C>> BPlusTree<V, C, N> {
    /// Drive merges upward from `node`, which just reported `NeedMerge`
    /// and holds SIX.
    ///
    /// # Safety
    ///
    /// `stack` ends with `node`, the epoch guard is held, and `node` is
    /// SIX-locked by the caller.
    pub(crate) unsafe fn merge_path(&self, stack: &mut Vec<*mut N>, node: *mut N) {
        let mut left = node;
        let mut key_buf = [0u8; MAX_KEY_LEN];

        stack.pop();
        loop {
            // SAFETY: all pointers stem from guarded traversals; lock
            // ownership follows the return-code contract.
            unsafe {
                // Probe: on None every SIX (including ours) is released.
                let Some(right) = (*left).get_mergeable_sibling() else {
                    return;
                };
                // A sibling exists, so the high key does too.
                let Some(del_len) = (*left).copy_high_key_into(&mut key_buf) else {
                    (*right).lock().unlock_six();
                    (*left).lock().unlock_six();
                    return;
                };
                let del_key = &key_buf[..del_len];

                // Locate and X-lock the parent holding the sibling's entry.
                let parent = loop {
                    let candidate = match stack.pop() {
                        Some(candidate) => candidate,
                        None => {
                            self.search_parent_stack(del_key, right, stack);
                            continue;
                        }
                    };
                    match N::range_lock_x(candidate, del_key) {
                        Some(parent) => break parent,
                        // Retired parent; rebuild the path.
                        None => stack.clear(),
                    }
                };

                match (*parent).delete_child(del_key) {
                    NodeRC::Completed => {
                        (*left).merge(right);
                        self.gc().retire(right.cast());
                        return;
                    }
                    NodeRC::AbortMerge => {
                        (*right).lock().unlock_six();
                        (*left).lock().unlock_six();
                        return;
                    }
                    NodeRC::NeedRetry => {
                        // Re-probe once the conflicting SMO settles; the
                        // sibling's SIX must drop first so the probe can
                        // take it again.
                        (*right).lock().unlock_six();
                        stack.push(parent);
                        std::thread::sleep(RETRY_WAIT);
                    }
                    NodeRC::NeedMerge => {
                        // The parent underflowed and now holds SIX.
                        (*left).merge(right);
                        self.gc().retire(right.cast());
                        if stack.is_empty() {
                            self.try_shrink(parent);
                            return;
                        }
                        left = parent;
                    }
                    _ => unreachable!("delete_child outcome"),
                }
            }
        }
    }

    /// Collapse single-child roots. `node` holds SIX; it is released in
    /// all cases.
    ///
    /// # Safety
    ///
    /// The epoch guard is held.
    pub(crate) unsafe fn try_shrink(&self, node: *mut N) {
        // SAFETY: lock ownership documented per step.
        unsafe {
            if self.root.load(READ_ORD) != node {
                (*node).lock().unlock_six();
                return;
            }

            let mut unlinked = Vec::new();
            let mut cur = node;
            while (*cur).is_inner() && (*cur).record_count() == 1 {
                let child = N::remove_root(cur);
                if child.is_null() {
                    // The child is SIX-held by a concurrent merge that
                    // waits for our lock; backing off breaks the cycle.
                    break;
                }
                unlinked.push(cur);
                cur = child;
            }

            if !unlinked.is_empty() {
                // Publish first, retire after: a reader entering now must
                // not be able to load a pointer that is already queued.
                let _swapped = self
                    .root
                    .compare_exchange(node, cur, ROOT_CAS, CAS_FAILURE)
                    .is_ok();
                debug_assert!(_swapped, "only the shrinker may replace a shrinking root");
                for retired in unlinked {
                    self.gc().retire(retired.cast());
                }
            }
            (*cur).lock().unlock_six();
        }
    }
}
