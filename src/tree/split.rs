//! Split completion and root growth.
//!
//! A leaf (or inner node) that reports `NeedSplit` is halved under the
//! SIX→X ladder, the pending record lands in whichever half covers its
//! key, and the new separator is pushed into the parent — recursing when
//! the parent is itself full, and growing a new root when the stack runs
//! out. Parents are located through the captured descent stack, with a
//! fresh descent whenever the stack turns out to be stale.

use crate::compare::KeyComp;
use crate::node::{InsertRc, MAX_KEY_LEN, NodeLayout, NodeRC};
use crate::ordering::{CAS_FAILURE, READ_ORD, ROOT_CAS};
use crate::page::release_page;

use super::{BPlusTree, RETRY_WAIT};

impl<V: Copy, C: KeyComp, N: NodeLayout<C>> BPlusTree<V, C, N> {
    /// Halve an X-locked full node.
    ///
    /// On return the node is X-locked with its high key set to the
    /// separator, and the returned right sibling is X-locked with its SMO
    /// flag set.
    ///
    /// # Safety
    ///
    /// Caller holds X on `node` and an epoch guard.
    pub(crate) unsafe fn half_split(&self, node: *mut N) -> *mut N {
        // SAFETY: we hold X; the ladder downgrades for the copy phase.
        unsafe {
            (*node).lock().downgrade_x_to_six();
            let right = self.new_node((*node).is_inner());
            // Fresh and unpublished: the lock is uncontended.
            (*right).lock().lock_x();
            (*node).split(right);
            right
        }
    }

    /// Split `node`, insert the pending record into the covering half, and
    /// complete the split upward. Returns the version of the committed
    /// insert.
    ///
    /// # Safety
    ///
    /// Caller holds X on `node` (which just reported `NeedSplit` for
    /// `key`), `stack` ends with `node`, and an epoch guard is held.
    pub(crate) unsafe fn split_insert(
        &self,
        stack: &mut Vec<*mut N>,
        node: *mut N,
        key: &[u8],
        payload: V,
    ) -> u64 {
        // SAFETY: lock ownership tracked through the ladder below.
        unsafe {
            let right = self.half_split(node);

            let mut sep = [0u8; MAX_KEY_LEN];
            let Some(sep_len) = (*node).copy_high_key_into(&mut sep) else {
                unreachable!("a split node carries a separator high key")
            };

            let target = N::valid_split_node(node, right, key);
            let version = match (*target).insert(key, payload) {
                InsertRc::Done(version) => version,
                // The key was absent (the insert reported NeedSplit) and
                // the halving made room.
                _ => unreachable!("post-split insert cannot fail"),
            };

            self.complete_split(stack, node, right, &sep, sep_len);
            version
        }
    }

    /// Install the routing entry for a finished node split, recursing up
    /// the captured stack.
    ///
    /// # Safety
    ///
    /// `left`/`right` are the unlocked halves of a completed split (right
    /// still SMO-flagged), `stack` ends with `left`, the epoch guard is
    /// held.
    pub(crate) unsafe fn complete_split(
        &self,
        stack: &mut Vec<*mut N>,
        left: *mut N,
        right: *mut N,
        sep: &[u8; MAX_KEY_LEN],
        sep_len: usize,
    ) {
        let mut left = left;
        let mut right = right;
        let mut sep = *sep;
        let mut sep_len = sep_len;

        stack.pop();
        loop {
            // SAFETY: all pointers stem from guarded traversals; lock
            // ownership follows the return-code contract.
            unsafe {
                if stack.is_empty() {
                    if self.try_root_split(left, right, &sep[..sep_len]) {
                        (*right).lock().clear_smo();
                        return;
                    }
                    // Someone grew or changed the root; find where the new
                    // right node belongs now.
                    self.search_parent_stack(&sep[..sep_len], right, stack);
                    continue;
                }

                let Some(&candidate) = stack.last() else {
                    continue;
                };
                let Some(parent) = N::range_lock_x(candidate, &sep[..sep_len]) else {
                    // The candidate parent was retired.
                    if self.try_root_split(left, right, &sep[..sep_len]) {
                        (*right).lock().clear_smo();
                        return;
                    }
                    stack.clear();
                    self.search_parent_stack(&sep[..sep_len], right, stack);
                    continue;
                };

                match (*parent).insert_child(right, &sep[..sep_len]) {
                    NodeRC::Completed => {
                        (*right).lock().clear_smo();
                        return;
                    }
                    NodeRC::NeedSplit => {
                        // The parent is full: split it under the X we
                        // still hold and climb one level.
                        let parent_right = self.half_split(parent);
                        let mut up_sep = [0u8; MAX_KEY_LEN];
                        let Some(up_len) = (*parent).copy_high_key_into(&mut up_sep) else {
                            unreachable!("a split node carries a separator high key")
                        };
                        let target = N::valid_split_node(parent, parent_right, &sep[..sep_len]);
                        match (*target).insert_child(right, &sep[..sep_len]) {
                            NodeRC::Completed => (*right).lock().clear_smo(),
                            _ => unreachable!("post-split child insert cannot fail"),
                        }

                        stack.pop();
                        left = parent;
                        right = parent_right;
                        sep = up_sep;
                        sep_len = up_len;
                    }
                    NodeRC::NeedRetry => {
                        // A racing merge still owns this separator.
                        std::thread::sleep(RETRY_WAIT);
                    }
                    _ => unreachable!("insert_child outcome"),
                }
            }
        }
    }

    /// Publish a new two-child root if `left` still is the root.
    ///
    /// # Safety
    ///
    /// `left`/`right` are live siblings; the epoch guard is held.
    pub(crate) unsafe fn try_root_split(&self, left: *mut N, right: *mut N, sep: &[u8]) -> bool {
        if self.root.load(READ_ORD) != left {
            return false;
        }
        let page = self.acquire_page();
        // SAFETY: fresh zeroed page; children outlive the new root.
        let new_root = unsafe { N::init_root(page, self.key_len, sep, left, right) };
        match self
            .root
            .compare_exchange(left, new_root, ROOT_CAS, CAS_FAILURE)
        {
            Ok(_) => true,
            Err(_) => {
                // Lost the race; the unpublished page was never visible.
                // SAFETY: exclusively ours.
                unsafe { release_page(page) };
                false
            }
        }
    }
}
