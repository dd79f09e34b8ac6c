//! # Tree Coordinator
//!
//! This module ties the per-page algorithms into a B+tree: root-to-leaf
//! descent, split propagation, merge-on-underfull, and ordered scans.
//!
//! ## Descent
//!
//! Every operation descends from the root using the inner nodes'
//! head-accelerated lower-bound search. A child position equal to the slot
//! count selects the node's `upper` child. Descent records the parent and
//! the child position within it, which is all the context splits and merges
//! need.
//!
//! ## Insert and Split
//!
//! ```text
//! 1. Descend to the leaf and try the page-level insert
//! 2. On page-full: choose a separator, reserve space for it in the parent
//! 3. If the parent lacks space: re-descend from the root and split the
//!    parent first, then retry the whole insert
//! 4. Split: allocate the left sibling, overwrite the original page with the
//!    right image (the parent's existing child reference stays valid), and
//!    insert the separator with the left page as its payload
//! 5. Splitting the root allocates a new inner root whose upper child is the
//!    old root
//! ```
//!
//! The retry loop restarts from the root after every structural change
//! instead of maintaining a parent stack, so the tree shape changing
//! underfoot is harmless.
//!
//! ## Remove and Merge
//!
//! Removal tracks the leaf's parent. When a removal leaves a page underfull,
//! the parent tries to merge it with the sibling next to it; the left page
//! of the pair is freed and the right one is overwritten with the merged
//! image. A successful merge can leave the parent itself underfull, in which
//! case the protocol repeats one level up after a fresh descent.
//!
//! ## Scans
//!
//! Pages carry no sibling pointers. A scan walks one leaf in order, then
//! re-descends using the leaf's fence keys as the seed for the next leaf:
//! the upper fence's immediate successor when ascending, the lower fence
//! itself when descending. Full keys are rebuilt from the page prefix plus
//! the stored suffix into a reused buffer handed to the callback.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use super::node::{merged_image, KeyBuf, Node, NodeMut, NodeTag, SearchResult, CHILD_REF_SIZE};
use crate::config::{MAX_KV_SIZE, PAGE_SIZE};
use crate::pool::{PageId, PagePool};

/// In-memory ordered byte-key index.
pub struct BTree {
    pool: PagePool,
    root: PageId,
}

/// Page-level accounting across the whole tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    pub pages: usize,
    pub inner_pages: usize,
    pub height: usize,
    pub bytes_free: usize,
    pub fill_factor: f64,
}

impl BTree {
    /// Create an empty tree; the root starts as a leaf with no slots.
    pub fn new() -> Self {
        let mut pool = PagePool::new();
        let root = pool.alloc();
        NodeMut::init(pool.page_mut(root), NodeTag::Leaf);
        Self { pool, root }
    }

    pub fn root_page(&self) -> PageId {
        self.root
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    fn node(&self, id: PageId) -> Node<'_> {
        Node::new(self.pool.page(id))
    }

    /// Walk from the root toward the leaf for `key`, stopping early when
    /// `stop` matches. Returns the reached node, its parent, and its
    /// position within the parent.
    fn descend(
        &self,
        key: &[u8],
        stop: impl Fn(PageId) -> bool,
    ) -> (PageId, Option<PageId>, usize) {
        let mut node_id = self.root;
        let mut parent = None;
        let mut pos = 0;
        loop {
            let node = self.node(node_id);
            if node.is_leaf() || stop(node_id) {
                return (node_id, parent, pos);
            }
            pos = node.lower_bound(key).index();
            parent = Some(node_id);
            node_id = node.child(pos);
        }
    }

    /// Point lookup. The returned payload borrows from the leaf that holds
    /// it and stays valid until the next mutating call.
    pub fn lookup(&self, key: &[u8]) -> Option<&[u8]> {
        let (leaf_id, _, _) = self.descend(key, |_| false);
        let leaf = self.node(leaf_id);
        match leaf.lower_bound(key) {
            SearchResult::Found(index) => Some(leaf.payload(index)),
            SearchResult::NotFound(_) => None,
        }
    }

    /// Insert a key/payload pair. Equal keys are kept as additional slots.
    #[tracing::instrument(skip_all)]
    pub fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        ensure!(
            key.len() + payload.len() <= MAX_KV_SIZE,
            "entry too large: key {} + payload {} bytes exceeds {}",
            key.len(),
            payload.len(),
            MAX_KV_SIZE
        );
        loop {
            let (leaf_id, parent, _) = self.descend(key, |_| false);
            if NodeMut::new(self.pool.page_mut(leaf_id)).insert(key, payload) {
                return Ok(());
            }
            // Leaf is full: split it (or an ancestor blocking the split) and
            // retry from the root.
            self.split_node(leaf_id, parent, key);
        }
    }

    fn split_node(&mut self, node_id: PageId, parent: Option<PageId>, key: &[u8]) {
        let parent_id = match parent {
            Some(id) => id,
            None => {
                let new_root = self.pool.alloc();
                let mut root = NodeMut::init(self.pool.page_mut(new_root), NodeTag::Inner);
                root.set_upper(node_id);
                self.root = new_root;
                debug!(root = new_root, "grew tree root");
                new_root
            }
        };

        let (info, sep_key) = {
            let node = self.node(node_id);
            let info = node.find_separator();
            (info, node.separator_key(info))
        };
        let needed = self
            .node(parent_id)
            .space_needed(sep_key.len(), CHILD_REF_SIZE);
        if !NodeMut::new(self.pool.page_mut(parent_id)).request_space(needed) {
            // Parent is full too; split it first, restarting from the root.
            self.ensure_space(parent_id, key);
            return;
        }

        let (left_image, right_image) = self.node(node_id).split_images(info.slot, &sep_key);
        let left_id = self.pool.alloc();
        self.pool.page_mut(left_id).copy_from(&left_image);
        self.pool.page_mut(node_id).copy_from(&right_image);
        let inserted =
            NodeMut::new(self.pool.page_mut(parent_id)).insert(&sep_key, &left_id.to_le_bytes());
        assert!(inserted, "parent rejected separator after space request");
        debug!(
            node = node_id,
            left = left_id,
            sep_len = sep_key.len(),
            "split node"
        );
    }

    /// Re-descend from the root to find `to_split`'s current parent, then
    /// split it.
    fn ensure_space(&mut self, to_split: PageId, key: &[u8]) {
        let (node_id, parent, _) = self.descend(key, |id| id == to_split);
        debug_assert_eq!(node_id, to_split);
        self.split_node(to_split, parent, key);
    }

    /// Remove one slot matching `key`. Returns true iff a slot was removed.
    #[tracing::instrument(skip_all)]
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let mut merge_target: Option<PageId> = None;
        loop {
            let (node_id, parent, pos) = self.descend(key, |id| Some(id) == merge_target);
            if merge_target.is_none() {
                let mut leaf = NodeMut::new(self.pool.page_mut(node_id));
                if !leaf.remove(key) {
                    return false;
                }
                if !leaf.as_node().is_underfull() {
                    return true;
                }
                merge_target = Some(node_id);
            }
            debug_assert_eq!(merge_target, Some(node_id));
            let Some(parent_id) = parent else {
                // The root may stay underfull.
                break;
            };
            if self.merge_children(parent_id, pos) && self.node(parent_id).is_underfull() {
                merge_target = Some(parent_id);
            } else {
                break;
            }
        }
        true
    }

    /// Merge the children on both sides of `pos` when the sibling is also
    /// underfull and the result fits one page. Returns true when a merge
    /// happened.
    fn merge_children(&mut self, parent_id: PageId, mut pos: usize) -> bool {
        let (left_id, right_id, sep_key) = {
            let parent = self.node(parent_id);
            debug_assert!(!parent.is_leaf());
            if pos == parent.count() {
                if pos == 0 {
                    return false;
                }
                pos -= 1;
                if !self.node(parent.child(pos)).is_underfull() {
                    return false;
                }
            } else if !self.node(parent.child(pos + 1)).is_underfull() {
                return false;
            }
            let mut sep = KeyBuf::new();
            sep.extend_from_slice(parent.prefix());
            sep.extend_from_slice(parent.key_suffix(pos));
            (parent.child(pos), parent.child(pos + 1), sep)
        };

        let image = {
            let left = self.node(left_id);
            let right = self.node(right_id);
            if left.is_leaf() {
                merged_image(&left, &right, None)
            } else {
                merged_image(&left, &right, Some((sep_key.as_slice(), left.upper())))
            }
        };
        let Some(image) = image else {
            return false;
        };

        self.pool.page_mut(right_id).copy_from(&image);
        self.pool.free(left_id);
        NodeMut::new(self.pool.page_mut(parent_id)).remove_slot(pos);
        debug!(
            parent = parent_id,
            left = left_id,
            right = right_id,
            "merged siblings"
        );
        true
    }

    /// Visit entries with keys `>= start` in ascending order until the
    /// callback returns false.
    pub fn scan_ascending(&self, start: &[u8], mut callback: impl FnMut(&[u8], &[u8]) -> bool) {
        let mut seed: KeyBuf = SmallVec::from_slice(start);
        let mut key = Vec::new();
        loop {
            let (leaf_id, _, _) = self.descend(&seed, |_| false);
            let leaf = self.node(leaf_id);
            for i in leaf.lower_bound(&seed).index()..leaf.count() {
                leaf.full_key_into(i, &mut key);
                if !callback(&key, leaf.payload(i)) {
                    return;
                }
            }
            let fence = leaf.upper_fence();
            if fence.is_empty() {
                return;
            }
            // The next leaf holds exactly the keys greater than this fence,
            // so its immediate successor is the next seed.
            seed.clear();
            seed.extend_from_slice(fence);
            seed.push(0);
        }
    }

    /// Visit entries with keys `<= start` in descending order until the
    /// callback returns false.
    pub fn scan_descending(&self, start: &[u8], mut callback: impl FnMut(&[u8], &[u8]) -> bool) {
        let mut seed: KeyBuf = SmallVec::from_slice(start);
        let mut key = Vec::new();
        loop {
            let (leaf_id, _, _) = self.descend(&seed, |_| false);
            let leaf = self.node(leaf_id);
            let first_above = match leaf.lower_bound(&seed) {
                SearchResult::Found(i) => i + 1,
                SearchResult::NotFound(i) => i,
            };
            for i in (0..first_above).rev() {
                leaf.full_key_into(i, &mut key);
                if !callback(&key, leaf.payload(i)) {
                    return;
                }
            }
            let fence = leaf.lower_fence();
            if fence.is_empty() {
                return;
            }
            // A key equal to the lower fence lives in the left neighbor, so
            // the fence itself seeds the next round.
            seed.clear();
            seed.extend_from_slice(fence);
        }
    }

    /// Levels between the root and the leaves, inclusive.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut id = self.root;
        while !self.node(id).is_leaf() {
            height += 1;
            id = self.node(id).upper();
        }
        height
    }

    pub fn stats(&self) -> TreeStats {
        let mut pages = 0;
        let mut inner_pages = 0;
        let mut bytes_free = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            pages += 1;
            bytes_free += node.free_space_after_compaction();
            if !node.is_leaf() {
                inner_pages += 1;
                for i in 0..=node.count() {
                    stack.push(node.child(i));
                }
            }
        }
        TreeStats {
            pages,
            inner_pages,
            height: self.height(),
            bytes_free,
            fill_factor: 1.0 - bytes_free as f64 / (pages * PAGE_SIZE) as f64,
        }
    }

    /// Check every page invariant plus fence/separator consistency across
    /// the whole tree.
    pub fn validate(&self) -> Result<()> {
        self.validate_node(self.root, &[], &[]).map(|_| ())
    }

    fn validate_node(&self, id: PageId, lower: &[u8], upper: &[u8]) -> Result<usize> {
        let node = self.node(id);
        node.validate()?;
        ensure!(node.lower_fence() == lower, "page {id}: lower fence mismatch");
        ensure!(node.upper_fence() == upper, "page {id}: upper fence mismatch");
        if node.is_leaf() {
            return Ok(1);
        }

        let mut child_lower = lower.to_vec();
        let mut separator = Vec::new();
        let mut depth = None;
        for i in 0..node.count() {
            node.full_key_into(i, &mut separator);
            let d = self.validate_node(node.child(i), &child_lower, &separator)?;
            ensure!(
                depth.is_none() || depth == Some(d),
                "page {id}: leaves at uneven depth"
            );
            depth = Some(d);
            child_lower.clear();
            child_lower.extend_from_slice(&separator);
        }
        let d = self.validate_node(node.upper(), &child_lower, upper)?;
        ensure!(
            depth.is_none() || depth == Some(d),
            "page {id}: leaves at uneven depth"
        );
        Ok(d + 1)
    }
}

impl Default for BTree {
    fn default() -> Self {
        Self::new()
    }
}
