//! Sort-free bulk construction.
//!
//! Leaves are streamed full first, each closing node emitting a routing
//! entry; inner layers are then stacked over those entries until a single
//! root remains. With multiple threads, each worker builds a partial tree
//! over a contiguous chunk, shorter partials are wrapped in extra layers
//! until all heights match, and the vertical border spines of adjacent
//! partials are linked level by level before the shared upper layers are
//! built.
//!
//! Bulk loading assumes exclusive access: no locks are taken and the
//! previous tree contents are torn down and replaced wholesale.

use std::ptr::null_mut;

use crate::compare::KeyComp;
use crate::node::{BULK_INNER_CAP, NodeLayout};
use crate::ordering::ROOT_CAS;

use super::{BPlusTree, delete_children};

/// A closed node and the first key it covers.
struct NodeEntry<N> {
    key: Vec<u8>,
    node: *mut N,
}

/// Worker result: partial-tree height plus its top-layer nodes.
struct PartialTree<N>(usize, Vec<NodeEntry<N>>);

// SAFETY: the node pointers reference pages built exclusively by one
// worker and handed off whole; no aliasing exists until linking, which
// happens single-threaded afterwards.
unsafe impl<N> Send for PartialTree<N> {}

impl<V: Copy, C: KeyComp, N: NodeLayout<C>> BPlusTree<V, C, N> {
    /// Replace the tree's contents with `entries`, which must be sorted
    /// ascending by key with no duplicates.
    ///
    /// `thread_num` workers build partial trees over contiguous chunks;
    /// values of 0 or 1 (or tiny inputs) load single-threaded. Must not
    /// run concurrently with any other operation on the tree.
    pub fn bulkload<K>(&self, entries: &[(K, V)], thread_num: usize)
    where
        K: AsRef<[u8]> + Sync,
        V: Send + Sync,
    {
        if entries.is_empty() {
            return;
        }

        let mut nodes = if thread_num <= 1 || entries.len() < thread_num {
            self.bulkload_partial(entries).1
        } else {
            self.bulkload_parallel(entries, thread_num)
        };

        // Stack inner layers until a single root remains.
        while nodes.len() > 1 {
            nodes = self.construct_inner_layer(&nodes);
        }
        let new_root = nodes[0].node;

        // The leftmost routing key at every level is an artifact of
        // construction; the leftmost child covers everything below its
        // neighbor's separator.
        // SAFETY: exclusive access; the new tree is not yet published.
        unsafe {
            let mut cur = new_root;
            while (*cur).is_inner() {
                (*cur).remove_leftmost_key();
                cur = (*cur).child_at(0);
            }
        }

        let old_root = self.root.swap(new_root, ROOT_CAS);
        // SAFETY: exclusive access; nothing can reach the old tree now.
        unsafe { delete_children::<C, N>(old_root) };
    }

    /// Fan the chunks out over scoped worker threads, align partial-tree
    /// heights, and link the vertical borders.
    fn bulkload_parallel<K>(&self, entries: &[(K, V)], thread_num: usize) -> Vec<NodeEntry<N>>
    where
        K: AsRef<[u8]> + Sync,
        V: Send + Sync,
    {
        let mut partials: Vec<PartialTree<N>> = Vec::with_capacity(thread_num);
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(thread_num);
            let mut start = 0usize;
            for i in 0..thread_num {
                let len = (entries.len() + i) / thread_num;
                let chunk = &entries[start..start + len];
                start += len;
                handles.push(scope.spawn(move || {
                    let (height, nodes) = self.bulkload_partial(chunk);
                    PartialTree(height, nodes)
                }));
            }
            for handle in handles {
                match handle.join() {
                    Ok(partial) => partials.push(partial),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });

        let tallest = partials.iter().map(|p| p.0).max().unwrap_or(1);

        let mut all = Vec::new();
        let mut prev_last: *mut N = null_mut();
        for PartialTree(mut height, mut nodes) in partials {
            // Wrap shorter partials until every top layer sits at the
            // same height.
            while height < tallest {
                nodes = self.construct_inner_layer(&nodes);
                height += 1;
            }
            if let (Some(first), false) = (nodes.first(), prev_last.is_null()) {
                // SAFETY: exclusive access to both unpublished spines.
                unsafe { self.link_vertical_border(prev_last, first.node) };
            }
            if let Some(last) = nodes.last() {
                prev_last = last.node;
            }
            all.extend(nodes);
        }
        all
    }

    /// Build one partial tree bottom-up; returns its height and top layer.
    fn bulkload_partial<K: AsRef<[u8]>>(&self, entries: &[(K, V)]) -> (usize, Vec<NodeEntry<N>>) {
        let mut nodes = self.construct_leaf_layer(entries);
        let mut height = 1;
        while nodes.len() > BULK_INNER_CAP {
            nodes = self.construct_inner_layer(&nodes);
            height += 1;
        }
        (height, nodes)
    }

    /// Stream entries into successive leaves, linking siblings and setting
    /// high keys as each node closes.
    fn construct_leaf_layer<K: AsRef<[u8]>>(&self, entries: &[(K, V)]) -> Vec<NodeEntry<N>> {
        let mut out = Vec::with_capacity(entries.len() / BULK_INNER_CAP + 1);
        let mut prev: *mut N = null_mut();
        let mut i = 0usize;
        while i < entries.len() {
            let node = self.new_node(false);
            // SAFETY: the node is unpublished; bulk appends are exclusive.
            let node_ref = unsafe { &*node };
            let first_key = entries[i].0.as_ref().to_vec();
            while i < entries.len() && node_ref.bulk_push(entries[i].0.as_ref(), entries[i].1) {
                i += 1;
            }
            if !prev.is_null() {
                // SAFETY: prev is this layer's previous unpublished node.
                unsafe {
                    (*prev).set_next(node);
                    (*prev).set_high_key(&first_key);
                }
            }
            out.push(NodeEntry {
                key: first_key,
                node,
            });
            prev = node;
        }
        out
    }

    /// Build one inner layer over a layer's routing entries.
    fn construct_inner_layer(&self, children: &[NodeEntry<N>]) -> Vec<NodeEntry<N>> {
        let mut out = Vec::with_capacity(children.len() / BULK_INNER_CAP + 1);
        let mut prev: *mut N = null_mut();
        let mut i = 0usize;
        while i < children.len() {
            let node = self.new_node(true);
            // SAFETY: the node is unpublished; bulk appends are exclusive.
            let node_ref = unsafe { &*node };
            let first_key = children[i].key.clone();
            while i < children.len() && node_ref.bulk_push(&children[i].key, children[i].node) {
                i += 1;
            }
            if !prev.is_null() {
                // SAFETY: prev is this layer's previous unpublished node.
                unsafe {
                    (*prev).set_next(node);
                    (*prev).set_high_key(&first_key);
                }
            }
            out.push(NodeEntry {
                key: first_key,
                node,
            });
            prev = node;
        }
        out
    }

    /// Link the rightmost spine of one partial tree to the leftmost spine
    /// of its neighbor, level by level down to the leaves.
    ///
    /// # Safety
    ///
    /// Exclusive access; both spines are unpublished and of equal height.
    unsafe fn link_vertical_border(&self, left_top: *mut N, right_top: *mut N) {
        let mut left = left_top;
        let mut right = right_top;
        // SAFETY: spine pointers come from the just-built partials.
        unsafe {
            loop {
                (*left).set_next(right);
                (*left).set_high_key((*right).key_at(0));
                if !(*left).is_inner() {
                    break;
                }
                left = (*left).child_at((*left).record_count() - 1);
                right = (*right).child_at(0);
            }
        }
    }
}
