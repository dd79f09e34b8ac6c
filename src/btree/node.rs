//! # Node Layout and Per-Page Algorithms
//!
//! This module implements the slotted page format shared by leaf and inner
//! nodes, together with every algorithm that operates on a single page:
//! lower-bound search, insert, remove, compaction, split image construction,
//! and sibling merging.
//!
//! ## Page Layout
//!
//! ```text
//! +----------------------+
//! | NodeHeader (88B)     |  tag, count, upper child, fences, hints
//! +----------------------+
//! | Slot Array           |  Slot structs (10B each), grows downward
//! | [Slot 0]             |  - head: [u8; 4] (order-preserving key head)
//! | [Slot 1]             |  - offset: u16 (blob offset within the page)
//! | ...                  |  - key_len: u16 (truncated key length)
//! |                      |  - payload_len: u16
//! +----------------------+
//! | Free Space           |
//! +----------------------+
//! | Heap                 |  Grows upward from page end: fence keys,
//! | (key suffix |        |  truncated key suffixes, payloads
//! |  payload)            |
//! +----------------------+
//! ```
//!
//! Leaf and inner nodes share this layout byte for byte; the tag at offset 0
//! selects the interpretation. Inner nodes store a child reference as each
//! slot's payload and keep one extra child (`upper`) in the header, so a node
//! with `count` slots has `count + 1` children.
//!
//! ## Fence Keys and Prefix Truncation
//!
//! Every page carries two fence keys in its heap: `lower_fence` (exclusive
//! lower bound) and `upper_fence` (inclusive upper bound). All keys on the
//! page start with the fences' common prefix, so only the suffix past
//! `prefix_len` is stored per slot. The prefix bytes themselves are read from
//! the lower fence. The root's fences are both empty.
//!
//! ## Key Heads
//!
//! Each slot stores the first four bytes of its truncated key, zero-padded
//! and packed big-endian. Interpreted as a `u32` the head is
//! order-preserving: whenever two heads differ, their comparison equals the
//! lexicographic comparison of the keys. Binary search therefore resolves
//! most steps with one integer compare and only touches key bytes on head
//! ties.
//!
//! ## Search Hints
//!
//! The header keeps 16 equally spaced head samples. Searches on pages with
//! more than 32 slots use them to narrow the binary-search window before
//! touching any slot, which keeps cache misses on hot inner nodes low.
//!
//! ## Temporary-Image Discipline
//!
//! Compaction, splitting, and merging never rewrite a page incrementally.
//! They build a fresh image in a scratch page and the caller copies it over
//! the target in one step, so a page is always either untouched or fully
//! rebuilt, and its pool identity never changes.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HINT_COUNT, PAGE_SIZE, UNDERFULL_FREE_SPACE};
use crate::pool::{Page, PageId};

pub const HEADER_SIZE: usize = size_of::<NodeHeader>();
pub const SLOT_SIZE: usize = size_of::<Slot>();

/// Size of a child reference stored as an inner-slot payload.
pub const CHILD_REF_SIZE: usize = size_of::<PageId>();

/// Stack-friendly buffer for separator keys and scan seeds.
pub type KeyBuf = SmallVec<[u8; 64]>;

const _: () = {
    assert!(HEADER_SIZE == 88);
    assert!(SLOT_SIZE == 10);
    // A page must hold the header plus at least two maximum-size entries.
    assert!(HEADER_SIZE + 2 * (SLOT_SIZE + crate::config::MAX_KV_SIZE) <= PAGE_SIZE);
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTag {
    Inner = 0x01,
    Leaf = 0x02,
}

impl NodeTag {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => NodeTag::Inner,
            0x02 => NodeTag::Leaf,
            _ => panic!("invalid node tag: {b:#04x}"),
        }
    }
}

/// Offset/length pair locating a fence key in the heap.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FenceSlot {
    pub offset: u16,
    pub length: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NodeHeader {
    tag: u8,
    _reserved: u8,
    count: u16,
    /// Rightmost child, used by inner nodes only.
    upper: PageId,
    lower_fence: FenceSlot,
    upper_fence: FenceSlot,
    space_used: u16,
    data_offset: u16,
    prefix_len: u16,
    _reserved2: u16,
    hint: [u32; HINT_COUNT],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct Slot {
    head: [u8; 4],
    offset: U16<LittleEndian>,
    key_len: U16<LittleEndian>,
    payload_len: U16<LittleEndian>,
}

impl Slot {
    pub fn new(suffix: &[u8], offset: u16, payload_len: u16) -> Self {
        Self::from_parts(key_head(suffix), offset, suffix.len() as u16, payload_len)
    }

    pub fn from_parts(head: [u8; 4], offset: u16, key_len: u16, payload_len: u16) -> Self {
        Self {
            head,
            offset: U16::new(offset),
            key_len: U16::new(key_len),
            payload_len: U16::new(payload_len),
        }
    }

    pub fn head_u32(&self) -> u32 {
        u32::from_be_bytes(self.head)
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn key_len(&self) -> usize {
        self.key_len.get() as usize
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len.get() as usize
    }
}

/// Order-preserving head of a truncated key: the first four bytes,
/// zero-padded on the right, packed big-endian.
pub fn key_head(suffix: &[u8]) -> [u8; 4] {
    let mut head = [0u8; 4];
    let len = suffix.len().min(4);
    head[..len].copy_from_slice(&suffix[..len]);
    head
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn slot_off(index: usize) -> usize {
    HEADER_SIZE + index * SLOT_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    pub fn index(self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => i,
        }
    }

    pub fn is_found(self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

/// Split point chosen by [`Node::find_separator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparatorInfo {
    /// Slot at which the page splits; the slot stays on the left side in a
    /// leaf and migrates into the parent in an inner node.
    pub slot: usize,
    /// Full length of the separator key, prefix included.
    pub len: usize,
    /// When set, the separator is a truncation taken from `slot + 1`.
    pub truncated: bool,
}

/// Read-only view of one page.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    data: &'a [u8],
}

/// Mutable view of one page.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> Node<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self {
            data: page.as_bytes(),
        }
    }

    fn header(&self) -> &'a NodeHeader {
        // INVARIANT: pages are pool-aligned and at least HEADER_SIZE long
        NodeHeader::ref_from_bytes(&self.data[..HEADER_SIZE]).unwrap()
    }

    pub fn tag(&self) -> NodeTag {
        NodeTag::from_byte(self.header().tag)
    }

    pub fn is_leaf(&self) -> bool {
        self.tag() == NodeTag::Leaf
    }

    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    pub fn upper(&self) -> PageId {
        debug_assert!(!self.is_leaf());
        self.header().upper
    }

    pub fn prefix_len(&self) -> usize {
        self.header().prefix_len as usize
    }

    pub fn space_used(&self) -> usize {
        self.header().space_used as usize
    }

    fn fence(&self, fence: FenceSlot) -> &'a [u8] {
        &self.data[fence.offset as usize..fence.offset as usize + fence.length as usize]
    }

    pub fn lower_fence(&self) -> &'a [u8] {
        self.fence(self.header().lower_fence)
    }

    pub fn upper_fence(&self) -> &'a [u8] {
        self.fence(self.header().upper_fence)
    }

    /// The fences' common prefix, shared by every key on the page. The bytes
    /// live at the lower fence's heap position.
    pub fn prefix(&self) -> &'a [u8] {
        let h = self.header();
        &self.data[h.lower_fence.offset as usize..h.lower_fence.offset as usize + self.prefix_len()]
    }

    pub fn slot(&self, index: usize) -> &'a Slot {
        debug_assert!(index < self.count());
        // INVARIANT: Slot is unaligned and exactly SLOT_SIZE bytes
        Slot::ref_from_bytes(&self.data[slot_off(index)..slot_off(index) + SLOT_SIZE]).unwrap()
    }

    /// Truncated key bytes of a slot (prefix stripped).
    pub fn key_suffix(&self, index: usize) -> &'a [u8] {
        let s = self.slot(index);
        &self.data[s.offset()..s.offset() + s.key_len()]
    }

    pub fn payload(&self, index: usize) -> &'a [u8] {
        let s = self.slot(index);
        let start = s.offset() + s.key_len();
        &self.data[start..start + s.payload_len()]
    }

    /// Reconstruct the full key of a slot into `out`.
    pub fn full_key_into(&self, index: usize, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(self.prefix());
        out.extend_from_slice(self.key_suffix(index));
    }

    /// Child reference at `index`; `index == count` yields the upper child.
    pub fn child(&self, index: usize) -> PageId {
        debug_assert!(!self.is_leaf());
        debug_assert!(index <= self.count());
        if index == self.count() {
            return self.header().upper;
        }
        let payload = self.payload(index);
        // INVARIANT: inner payloads are exactly CHILD_REF_SIZE bytes
        PageId::from_le_bytes(payload.try_into().unwrap())
    }

    pub fn free_space(&self) -> usize {
        self.header().data_offset as usize - slot_off(self.count())
    }

    pub fn free_space_after_compaction(&self) -> usize {
        PAGE_SIZE - slot_off(self.count()) - self.space_used()
    }

    pub fn is_underfull(&self) -> bool {
        self.free_space_after_compaction() >= UNDERFULL_FREE_SPACE
    }

    /// Bytes required to insert a key of `key_len` (full length) with a
    /// payload of `payload_len`.
    pub fn space_needed(&self, key_len: usize, payload_len: usize) -> usize {
        assert!(key_len >= self.prefix_len(), "key below page prefix");
        SLOT_SIZE + (key_len - self.prefix_len()) + payload_len
    }

    /// Lower-bound search: index of the first slot whose key is `>=` the
    /// input, with an exact-match flag. Keys outside the page's prefix range
    /// resolve to the boundary positions.
    pub fn lower_bound(&self, key: &[u8]) -> SearchResult {
        let prefix = self.prefix();
        let cmp_len = key.len().min(prefix.len());
        match key[..cmp_len].cmp(&prefix[..cmp_len]) {
            Ordering::Less => return SearchResult::NotFound(0),
            Ordering::Greater => return SearchResult::NotFound(self.count()),
            Ordering::Equal => {}
        }
        if key.len() < prefix.len() {
            return SearchResult::NotFound(0);
        }
        let suffix = &key[prefix.len()..];
        let target_head = u32::from_be_bytes(key_head(suffix));

        let (mut lower, mut upper) = self.search_hint(target_head);
        while lower < upper {
            let mid = lower + (upper - lower) / 2;
            let slot = self.slot(mid);
            match target_head.cmp(&slot.head_u32()) {
                Ordering::Less => upper = mid,
                Ordering::Greater => lower = mid + 1,
                Ordering::Equal => match suffix.cmp(self.key_suffix(mid)) {
                    Ordering::Less => upper = mid,
                    Ordering::Greater => lower = mid + 1,
                    Ordering::Equal => return SearchResult::Found(mid),
                },
            }
        }
        SearchResult::NotFound(lower)
    }

    /// Narrow the binary-search range using the sampled head hints. Returns
    /// the half-open range to search.
    fn search_hint(&self, target_head: u32) -> (usize, usize) {
        let count = self.count();
        if count <= HINT_COUNT * 2 {
            return (0, count);
        }
        let hint = &self.header().hint;
        let dist = count / (HINT_COUNT + 1);
        let pos = (0..HINT_COUNT)
            .find(|&i| hint[i] >= target_head)
            .unwrap_or(HINT_COUNT);
        let pos2 = (pos..HINT_COUNT)
            .find(|&i| hint[i] != target_head)
            .unwrap_or(HINT_COUNT);
        let lower = pos * dist;
        let upper = if pos2 < HINT_COUNT {
            (pos2 + 1) * dist
        } else {
            count
        };
        (lower, upper)
    }

    /// Common prefix length of two stored (truncated) keys.
    pub fn common_prefix(&self, a: usize, b: usize) -> usize {
        common_prefix_len(self.key_suffix(a), self.key_suffix(b))
    }

    /// Choose the slot and separator length for splitting this page.
    ///
    /// Inner nodes split at the middle slot. Leaves with more than 16 slots
    /// scan a window left of the midpoint for the slot sharing the longest
    /// prefix with slot 0, which biases the separator toward short keys.
    /// When the two slots adjacent to the split point allow it, the
    /// separator is truncated to one byte past their common prefix.
    pub fn find_separator(&self) -> SeparatorInfo {
        let count = self.count();
        assert!(count > 1);
        if !self.is_leaf() {
            let slot = count / 2;
            return SeparatorInfo {
                slot,
                len: self.prefix_len() + self.slot(slot).key_len(),
                truncated: false,
            };
        }

        let best = if count > 16 {
            let window_lo = count / 2 - count / 16;
            let window_hi = count / 2;
            let mut best = window_lo;
            let mut best_prefix = self.common_prefix(window_lo, 0);
            for i in window_lo + 1..window_hi {
                let prefix = self.common_prefix(i, 0);
                if prefix > best_prefix {
                    best_prefix = prefix;
                    best = i;
                }
            }
            best
        } else {
            (count - 1) / 2
        };

        if best + 1 < count {
            let common = self.common_prefix(best, best + 1);
            if self.slot(best).key_len() > common && self.slot(best + 1).key_len() > common + 1 {
                return SeparatorInfo {
                    slot: best,
                    len: self.prefix_len() + common + 1,
                    truncated: true,
                };
            }
        }
        SeparatorInfo {
            slot: best,
            len: self.prefix_len() + self.slot(best).key_len(),
            truncated: false,
        }
    }

    /// Materialize the separator key described by `info`.
    pub fn separator_key(&self, info: SeparatorInfo) -> KeyBuf {
        let mut key = KeyBuf::new();
        key.extend_from_slice(self.prefix());
        let source = info.slot + info.truncated as usize;
        key.extend_from_slice(&self.key_suffix(source)[..info.len - self.prefix_len()]);
        key
    }

    /// Copy `n` slots starting at `src_start` into `dst`, re-truncating keys
    /// against the destination's prefix. When the destination prefix is
    /// longer (compaction, split), key suffixes shrink and are copied
    /// directly from the heap; when it is shorter (merge), full keys are
    /// reconstructed and re-stored.
    pub fn copy_range_to(&self, dst: &mut NodeMut<'_>, src_start: usize, n: usize) {
        debug_assert!(src_start + n <= self.count());
        let src_prefix = self.prefix_len();
        let dst_prefix = dst.prefix_len();
        if src_prefix <= dst_prefix {
            let diff = dst_prefix - src_prefix;
            for i in src_start..src_start + n {
                let s = *self.slot(i);
                debug_assert!(s.key_len() >= diff);
                let key_len = s.key_len() - diff;
                let space = key_len + s.payload_len();
                let blob_start = s.offset() + diff;
                let head = key_head(&self.data[blob_start..blob_start + key_len]);
                let off = dst.alloc_heap(space);
                dst.data[off..off + space]
                    .copy_from_slice(&self.data[blob_start..blob_start + space]);
                dst.push_slot(Slot::from_parts(
                    head,
                    off as u16,
                    key_len as u16,
                    s.payload_len() as u16,
                ));
            }
        } else {
            let mut key = KeyBuf::new();
            for i in src_start..src_start + n {
                key.clear();
                key.extend_from_slice(self.prefix());
                key.extend_from_slice(self.key_suffix(i));
                dst.push_key_value(&key, self.payload(i));
            }
        }
    }

    /// Build the left and right page images for splitting this page at
    /// `sep_slot` with separator `sep_key`. In a leaf the split slot stays on
    /// the left side; in an inner node it migrates into the parent and the
    /// left image inherits its child as `upper`.
    pub fn split_images(&self, sep_slot: usize, sep_key: &[u8]) -> (Box<Page>, Box<Page>) {
        assert!(self.count() > 1);
        let mut left_page = Page::zeroed();
        let mut right_page = Page::zeroed();
        {
            let mut left = NodeMut::init(&mut left_page, self.tag());
            left.set_fences(self.lower_fence(), sep_key);
            let mut right = NodeMut::init(&mut right_page, self.tag());
            right.set_fences(sep_key, self.upper_fence());
            if self.is_leaf() {
                self.copy_range_to(&mut left, 0, sep_slot + 1);
                self.copy_range_to(&mut right, sep_slot + 1, self.count() - sep_slot - 1);
            } else {
                self.copy_range_to(&mut left, 0, sep_slot);
                self.copy_range_to(&mut right, sep_slot + 1, self.count() - sep_slot - 1);
                left.set_upper(self.child(sep_slot));
                right.set_upper(self.upper());
            }
            left.make_hint();
            right.make_hint();
        }
        (left_page, right_page)
    }

    /// Check the page invariants, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        let h = self.header();
        ensure!(
            h.tag == NodeTag::Inner as u8 || h.tag == NodeTag::Leaf as u8,
            "invalid node tag {:#04x}",
            h.tag
        );
        ensure!(
            slot_off(self.count()) <= h.data_offset as usize,
            "slot array overlaps heap: count={} data_offset={}",
            self.count(),
            h.data_offset
        );
        ensure!(
            h.data_offset as usize <= PAGE_SIZE,
            "data_offset {} beyond page",
            h.data_offset
        );
        ensure!(
            self.prefix_len() == common_prefix_len(self.lower_fence(), self.upper_fence()),
            "prefix_len {} does not match fences",
            self.prefix_len()
        );

        let mut used = self.lower_fence().len() + self.upper_fence().len();
        for i in 0..self.count() {
            let s = self.slot(i);
            ensure!(
                s.offset() >= h.data_offset as usize
                    && s.offset() + s.key_len() + s.payload_len() <= PAGE_SIZE,
                "slot {i} blob out of bounds"
            );
            ensure!(
                s.head == key_head(self.key_suffix(i)),
                "slot {i} head mismatch"
            );
            if !self.is_leaf() {
                ensure!(
                    s.payload_len() == CHILD_REF_SIZE,
                    "inner slot {i} payload is not a child reference"
                );
            }
            if i > 0 {
                ensure!(
                    self.key_suffix(i - 1) <= self.key_suffix(i),
                    "slots {} and {} out of order",
                    i - 1,
                    i
                );
            }
            used += s.key_len() + s.payload_len();
        }
        ensure!(
            used == self.space_used(),
            "space_used {} != accounted {}",
            self.space_used(),
            used
        );

        if self.count() > HINT_COUNT * 2 {
            let dist = self.count() / (HINT_COUNT + 1);
            for i in 0..HINT_COUNT {
                ensure!(
                    h.hint[i] == self.slot(dist * (i + 1)).head_u32(),
                    "hint {i} is stale"
                );
            }
        }
        Ok(())
    }
}

impl<'a> NodeMut<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self {
            data: page.as_bytes_mut(),
        }
    }

    /// Initialize a page as an empty node with both fences empty.
    pub fn init(page: &'a mut Page, tag: NodeTag) -> Self {
        let header = NodeHeader {
            tag: tag as u8,
            _reserved: 0,
            count: 0,
            upper: 0,
            lower_fence: FenceSlot { offset: 0, length: 0 },
            upper_fence: FenceSlot { offset: 0, length: 0 },
            space_used: 0,
            data_offset: PAGE_SIZE as u16,
            prefix_len: 0,
            _reserved2: 0,
            hint: [0; HINT_COUNT],
        };
        let data = page.as_bytes_mut();
        data[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        Self { data }
    }

    pub fn as_node(&self) -> Node<'_> {
        Node { data: self.data }
    }

    fn header(&self) -> &NodeHeader {
        // INVARIANT: pages are pool-aligned and at least HEADER_SIZE long
        NodeHeader::ref_from_bytes(&self.data[..HEADER_SIZE]).unwrap()
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        // INVARIANT: pages are pool-aligned and at least HEADER_SIZE long
        NodeHeader::mut_from_bytes(&mut self.data[..HEADER_SIZE]).unwrap()
    }

    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    pub fn prefix_len(&self) -> usize {
        self.header().prefix_len as usize
    }

    pub fn set_upper(&mut self, child: PageId) {
        self.header_mut().upper = child;
    }

    /// Write the fence keys of a fresh page and derive the shared prefix.
    pub fn set_fences(&mut self, lower: &[u8], upper: &[u8]) {
        debug_assert_eq!(self.count(), 0);
        let lower_off = self.write_data(lower);
        let upper_off = self.write_data(upper);
        let prefix = common_prefix_len(lower, upper);
        let h = self.header_mut();
        h.lower_fence = FenceSlot {
            offset: lower_off,
            length: lower.len() as u16,
        };
        h.upper_fence = FenceSlot {
            offset: upper_off,
            length: upper.len() as u16,
        };
        h.prefix_len = prefix as u16;
    }

    /// Reserve `len` heap bytes, returning their offset.
    fn alloc_heap(&mut self, len: usize) -> usize {
        let h = self.header_mut();
        h.data_offset -= len as u16;
        h.space_used += len as u16;
        let off = h.data_offset as usize;
        debug_assert!(slot_off(self.count()) <= off);
        off
    }

    fn write_data(&mut self, bytes: &[u8]) -> u16 {
        let off = self.alloc_heap(bytes.len());
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        off as u16
    }

    fn set_slot(&mut self, index: usize, slot: Slot) {
        self.data[slot_off(index)..slot_off(index) + SLOT_SIZE].copy_from_slice(slot.as_bytes());
    }

    /// Append a pre-built slot; the blob must already be in the heap.
    fn push_slot(&mut self, slot: Slot) {
        let count = self.count();
        self.header_mut().count = (count + 1) as u16;
        debug_assert!(slot_off(count + 1) <= self.header().data_offset as usize);
        self.set_slot(count, slot);
    }

    /// Append a full key and payload past the current last slot.
    pub fn push_key_value(&mut self, key: &[u8], payload: &[u8]) {
        let count = self.count();
        self.header_mut().count = (count + 1) as u16;
        self.store_key_value(count, key, payload);
    }

    /// Write a key (truncated against the page prefix) and payload into the
    /// heap and point slot `index` at them.
    fn store_key_value(&mut self, index: usize, key: &[u8], payload: &[u8]) {
        let prefix_len = self.prefix_len();
        assert!(key.len() >= prefix_len, "key below page prefix");
        let suffix = &key[prefix_len..];
        let space = suffix.len() + payload.len();
        let off = self.alloc_heap(space);
        self.data[off..off + suffix.len()].copy_from_slice(suffix);
        self.data[off + suffix.len()..off + space].copy_from_slice(payload);
        self.set_slot(index, Slot::new(suffix, off as u16, payload.len() as u16));
    }

    /// Insert a key/payload pair, keeping slots sorted. Returns false when
    /// the page lacks space even after compaction; the page is unchanged in
    /// that case.
    pub fn insert(&mut self, key: &[u8], payload: &[u8]) -> bool {
        let needed = self.as_node().space_needed(key.len(), payload.len());
        if !self.request_space(needed) {
            return false;
        }
        let index = self.as_node().lower_bound(key).index();
        let count = self.count();
        self.data
            .copy_within(slot_off(index)..slot_off(count), slot_off(index + 1));
        self.header_mut().count = (count + 1) as u16;
        self.store_key_value(index, key, payload);
        self.update_hint(index);
        true
    }

    /// Remove an exact-match key. Returns false when the key is absent.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.as_node().lower_bound(key) {
            SearchResult::Found(index) => {
                self.remove_slot(index);
                true
            }
            SearchResult::NotFound(_) => false,
        }
    }

    pub fn remove_slot(&mut self, index: usize) {
        let count = self.count();
        debug_assert!(index < count);
        let slot = *self.as_node().slot(index);
        let h = self.header_mut();
        h.space_used -= (slot.key_len() + slot.payload_len()) as u16;
        self.data
            .copy_within(slot_off(index + 1)..slot_off(count), slot_off(index));
        self.header_mut().count = (count - 1) as u16;
        self.make_hint();
    }

    /// Ensure `needed` bytes of contiguous free space, compacting the page
    /// when fragmentation alone is the obstacle.
    pub fn request_space(&mut self, needed: usize) -> bool {
        if needed <= self.as_node().free_space() {
            return true;
        }
        if needed <= self.as_node().free_space_after_compaction() {
            self.compactify();
            return true;
        }
        false
    }

    /// Rebuild the page in a scratch image to squeeze out heap fragmentation
    /// left behind by removals.
    pub fn compactify(&mut self) {
        let want = self.as_node().free_space_after_compaction();
        let mut scratch = Page::zeroed();
        {
            let me = self.as_node();
            let mut tmp = NodeMut::init(&mut scratch, me.tag());
            tmp.set_fences(me.lower_fence(), me.upper_fence());
            me.copy_range_to(&mut tmp, 0, me.count());
            tmp.header_mut().upper = me.header().upper;
            tmp.make_hint();
        }
        self.data.copy_from_slice(scratch.as_bytes());
        debug_assert_eq!(self.as_node().free_space(), want);
    }

    /// Rebuild the full hint array from the current slots.
    pub fn make_hint(&mut self) {
        let count = self.count();
        if count == 0 {
            return;
        }
        let dist = count / (HINT_COUNT + 1);
        let heads: [u32; HINT_COUNT] =
            std::array::from_fn(|i| self.as_node().slot(dist * (i + 1)).head_u32());
        self.header_mut().hint = heads;
    }

    /// Refresh only the hint entries affected by an insert at `index`.
    pub fn update_hint(&mut self, index: usize) {
        let count = self.count();
        if count == 0 {
            return;
        }
        let dist = count / (HINT_COUNT + 1);
        let begin = if count > HINT_COUNT * 2 + 1
            && (count - 1) / (HINT_COUNT + 1) == dist
            && index / dist > 1
        {
            index / dist - 1
        } else {
            0
        };
        for i in begin..HINT_COUNT {
            let head = self.as_node().slot(dist * (i + 1)).head_u32();
            self.header_mut().hint[i] = head;
        }
    }
}

/// Build the merged image of two adjacent siblings, or `None` when the
/// contents cannot fit one page. For inner nodes the parent's separator moves
/// into the merged node as a regular slot whose payload is the left node's
/// upper child. The caller overwrites the right page with the image and frees
/// the left page, so the parent's reference to the right child stays valid.
pub fn merged_image(
    left: &Node<'_>,
    right: &Node<'_>,
    separator: Option<(&[u8], PageId)>,
) -> Option<Box<Page>> {
    debug_assert_eq!(left.tag(), right.tag());
    debug_assert_eq!(left.is_leaf(), separator.is_none());
    let mut page = Page::zeroed();
    {
        let mut tmp = NodeMut::init(&mut page, left.tag());
        tmp.set_fences(left.lower_fence(), right.upper_fence());
        let new_prefix = tmp.prefix_len();

        let left_grow = (left.prefix_len() - new_prefix) * left.count();
        let right_grow = (right.prefix_len() - new_prefix) * right.count();
        let mut bound = left.space_used()
            + right.space_used()
            + slot_off(left.count() + right.count())
            + left_grow
            + right_grow;
        if let Some((sep_key, _)) = separator {
            bound += tmp.as_node().space_needed(sep_key.len(), CHILD_REF_SIZE);
        }
        if bound > PAGE_SIZE {
            return None;
        }

        left.copy_range_to(&mut tmp, 0, left.count());
        if let Some((sep_key, left_upper)) = separator {
            tmp.push_key_value(sep_key, &left_upper.to_le_bytes());
        }
        right.copy_range_to(&mut tmp, 0, right.count());
        if !left.is_leaf() {
            tmp.set_upper(right.upper());
        }
        tmp.make_hint();
    }
    Some(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page() -> Box<Page> {
        let mut page = Page::zeroed();
        NodeMut::init(&mut page, NodeTag::Leaf);
        page
    }

    #[test]
    fn header_is_88_bytes() {
        assert_eq!(size_of::<NodeHeader>(), 88);
    }

    #[test]
    fn slot_is_10_bytes() {
        assert_eq!(size_of::<Slot>(), 10);
    }

    #[test]
    fn key_head_length_cases() {
        assert_eq!(key_head(b""), [0, 0, 0, 0]);
        assert_eq!(key_head(b"a"), [b'a', 0, 0, 0]);
        assert_eq!(key_head(b"ab"), [b'a', b'b', 0, 0]);
        assert_eq!(key_head(b"abc"), [b'a', b'b', b'c', 0]);
        assert_eq!(key_head(b"abcd"), [b'a', b'b', b'c', b'd']);
        assert_eq!(key_head(b"abcde"), [b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn key_head_is_order_preserving() {
        let keys: &[&[u8]] = &[b"", b"\x00", b"a", b"a\x00", b"ab", b"b", b"zzzz"];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                let (ha, hb) = (
                    u32::from_be_bytes(key_head(a)),
                    u32::from_be_bytes(key_head(b)),
                );
                if ha != hb {
                    assert_eq!(ha < hb, a < b, "{a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn init_produces_empty_leaf() {
        let mut page = Page::zeroed();
        let node = NodeMut::init(&mut page, NodeTag::Leaf);

        assert_eq!(node.count(), 0);
        assert_eq!(node.as_node().free_space(), PAGE_SIZE - HEADER_SIZE);
        assert!(node.as_node().lower_fence().is_empty());
        assert!(node.as_node().upper_fence().is_empty());
        node.as_node().validate().unwrap();
    }

    #[test]
    fn insert_and_read_single_entry() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        assert!(node.insert(b"key1", b"value1"));

        let view = node.as_node();
        assert_eq!(view.count(), 1);
        assert_eq!(view.key_suffix(0), b"key1");
        assert_eq!(view.payload(0), b"value1");
        view.validate().unwrap();
    }

    #[test]
    fn insert_maintains_sorted_order() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"charlie", b"3");
        node.insert(b"alpha", b"1");
        node.insert(b"bravo", b"2");

        let view = node.as_node();
        assert_eq!(view.key_suffix(0), b"alpha");
        assert_eq!(view.key_suffix(1), b"bravo");
        assert_eq!(view.key_suffix(2), b"charlie");
        view.validate().unwrap();
    }

    #[test]
    fn lower_bound_found_and_not_found() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"beta", b"2");
        node.insert(b"delta", b"4");

        let view = node.as_node();
        assert_eq!(view.lower_bound(b"beta"), SearchResult::Found(0));
        assert_eq!(view.lower_bound(b"delta"), SearchResult::Found(1));
        assert_eq!(view.lower_bound(b"alpha"), SearchResult::NotFound(0));
        assert_eq!(view.lower_bound(b"charlie"), SearchResult::NotFound(1));
        assert_eq!(view.lower_bound(b"omega"), SearchResult::NotFound(2));
    }

    #[test]
    fn lower_bound_resolves_head_collisions() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"test1", b"a");
        node.insert(b"test2", b"b");
        node.insert(b"test3", b"c");

        let view = node.as_node();
        assert_eq!(view.lower_bound(b"test1"), SearchResult::Found(0));
        assert_eq!(view.lower_bound(b"test3"), SearchResult::Found(2));
        assert_eq!(view.lower_bound(b"test0"), SearchResult::NotFound(0));
        assert_eq!(view.lower_bound(b"test4"), SearchResult::NotFound(3));
    }

    #[test]
    fn lower_bound_handles_key_prefix_of_stored_key() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"ab", b"1");
        node.insert(b"abc", b"2");

        let view = node.as_node();
        assert_eq!(view.lower_bound(b"ab"), SearchResult::Found(0));
        assert_eq!(view.lower_bound(b"a"), SearchResult::NotFound(0));
        assert_eq!(view.lower_bound(b"abcd"), SearchResult::NotFound(2));
    }

    #[test]
    fn duplicate_key_inserts_additional_slot() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"dup", b"old");
        node.insert(b"dup", b"new");

        let view = node.as_node();
        assert_eq!(view.count(), 2);
        assert_eq!(view.key_suffix(0), b"dup");
        assert_eq!(view.key_suffix(1), b"dup");
        assert_eq!(view.payload(0), b"new");
        assert_eq!(view.payload(1), b"old");
        view.validate().unwrap();
    }

    #[test]
    fn remove_shifts_slots_and_accounts_space() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"a", b"1");
        node.insert(b"b", b"2");
        node.insert(b"c", b"3");

        assert!(node.remove(b"b"));
        assert!(!node.remove(b"b"));

        let view = node.as_node();
        assert_eq!(view.count(), 2);
        assert_eq!(view.key_suffix(0), b"a");
        assert_eq!(view.key_suffix(1), b"c");
        view.validate().unwrap();
    }

    #[test]
    fn fences_define_prefix_and_truncate_keys() {
        let mut page = Page::zeroed();
        let mut node = NodeMut::init(&mut page, NodeTag::Leaf);
        node.set_fences(b"user:1000", b"user:1999");

        assert_eq!(node.prefix_len(), 6);
        node.insert(b"user:1234", b"alice");

        let view = node.as_node();
        assert_eq!(view.prefix(), b"user:1");
        assert_eq!(view.key_suffix(0), b"234");
        assert_eq!(view.lower_bound(b"user:1234"), SearchResult::Found(0));
        assert_eq!(view.lower_bound(b"user:0999"), SearchResult::NotFound(0));
        assert_eq!(view.lower_bound(b"user:2000"), SearchResult::NotFound(1));
        assert_eq!(view.lower_bound(b"user"), SearchResult::NotFound(0));
        view.validate().unwrap();
    }

    #[test]
    fn insert_fails_when_page_is_full() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        let payload = [0xAB; 64];
        let mut inserted = 0u32;
        loop {
            let key = format!("key{inserted:06}");
            if !node.insert(key.as_bytes(), &payload) {
                break;
            }
            inserted += 1;
        }

        assert!(inserted > 10);
        let view = node.as_node();
        assert_eq!(view.count() as u32, inserted);
        view.validate().unwrap();
    }

    #[test]
    fn compaction_reclaims_fragmented_space() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        let payload = [0x55; 100];
        let mut keys = Vec::new();
        let mut i = 0u32;
        loop {
            let key = format!("key{i:06}");
            if !node.insert(key.as_bytes(), &payload) {
                break;
            }
            keys.push(key);
            i += 1;
        }

        for key in keys.iter().step_by(2) {
            assert!(node.remove(key.as_bytes()));
        }

        // Fits only after the heap is compacted.
        let big_payload = vec![0x77u8; PAGE_SIZE / 4];
        assert!(node.insert(b"zzz-big", &big_payload));

        let view = node.as_node();
        view.validate().unwrap();
        assert_eq!(
            view.lower_bound(b"zzz-big"),
            SearchResult::Found(view.count() - 1)
        );
        for key in keys.iter().skip(1).step_by(2) {
            assert!(view.lower_bound(key.as_bytes()).is_found());
        }
    }

    #[test]
    fn compaction_preserves_free_space_prediction() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        for i in 0..50 {
            node.insert(format!("key{i:04}").as_bytes(), b"payload");
        }
        for i in (0..50).step_by(3) {
            node.remove(format!("key{i:04}").as_bytes());
        }

        let predicted = node.as_node().free_space_after_compaction();
        node.compactify();
        assert_eq!(node.as_node().free_space(), predicted);
        node.as_node().validate().unwrap();
    }

    #[test]
    fn hints_stay_consistent_on_large_pages() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        for i in 0..100 {
            assert!(node.insert(format!("key{i:04}").as_bytes(), b"v"));
        }

        let view = node.as_node();
        assert!(view.count() > HINT_COUNT * 2);
        view.validate().unwrap();
        for i in 0..100 {
            let key = format!("key{i:04}");
            assert!(view.lower_bound(key.as_bytes()).is_found(), "{key}");
        }
    }

    #[test]
    fn find_separator_middle_for_small_leaf() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        for key in [b"aa", b"bb", b"cc", b"dd"] {
            node.insert(key, b"v");
        }

        let info = node.as_node().find_separator();
        assert_eq!(info.slot, 1);
    }

    #[test]
    fn find_separator_truncates_between_neighbors() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"apple", b"1");
        node.insert(b"apricot", b"2");
        node.insert(b"banana", b"3");
        node.insert(b"blueberry", b"4");

        // Split slot is "apricot"; neighbors "apricot"/"banana" share no
        // prefix, so the separator truncates to a single byte.
        let info = node.as_node().find_separator();
        assert_eq!(info.slot, 1);
        assert!(info.truncated);
        let sep = node.as_node().separator_key(info);
        assert_eq!(&sep[..], b"b");
    }

    #[test]
    fn separator_falls_back_to_full_key_for_adjacent_duplicates() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        node.insert(b"same", b"1");
        node.insert(b"same", b"2");

        let info = node.as_node().find_separator();
        assert!(!info.truncated);
        assert_eq!(&node.as_node().separator_key(info)[..], b"same");
    }

    #[test]
    fn split_images_partition_a_leaf() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);

        for i in 0..100 {
            node.insert(format!("key{i:04}").as_bytes(), b"value");
        }

        let view = node.as_node();
        let info = view.find_separator();
        let sep = view.separator_key(info);
        let (left, right) = view.split_images(info.slot, &sep);

        let left_view = Node::new(&left);
        let right_view = Node::new(&right);
        left_view.validate().unwrap();
        right_view.validate().unwrap();
        assert_eq!(left_view.count(), info.slot + 1);
        assert_eq!(left_view.count() + right_view.count(), view.count());
        assert_eq!(left_view.upper_fence(), &sep[..]);
        assert_eq!(right_view.lower_fence(), &sep[..]);
        assert_eq!(right_view.upper_fence(), view.upper_fence());

        // Every key stays findable on exactly one side.
        for i in 0..100 {
            let key = format!("key{i:04}");
            let on_left = left_view.lower_bound(key.as_bytes()).is_found();
            let on_right = right_view.lower_bound(key.as_bytes()).is_found();
            assert!(on_left ^ on_right, "{key}");
        }
    }

    #[test]
    fn merged_image_rejoins_leaf_siblings() {
        let mut page = leaf_page();
        let mut node = NodeMut::new(&mut page);
        for i in 0..60 {
            node.insert(format!("key{i:04}").as_bytes(), b"value");
        }

        let view = node.as_node();
        let info = view.find_separator();
        let sep = view.separator_key(info);
        let (left, right) = view.split_images(info.slot, &sep);

        let merged = merged_image(&Node::new(&left), &Node::new(&right), None).unwrap();
        let merged_view = Node::new(&merged);
        merged_view.validate().unwrap();
        assert_eq!(merged_view.count(), 60);
        assert_eq!(merged_view.lower_fence(), view.lower_fence());
        assert_eq!(merged_view.upper_fence(), view.upper_fence());
        for i in 0..60 {
            assert!(merged_view
                .lower_bound(format!("key{i:04}").as_bytes())
                .is_found());
        }
    }

    #[test]
    fn merged_image_refuses_oversized_result() {
        let mut left_page = Page::zeroed();
        let mut left = NodeMut::init(&mut left_page, NodeTag::Leaf);
        left.set_fences(b"", b"m");
        let mut right_page = Page::zeroed();
        let mut right = NodeMut::init(&mut right_page, NodeTag::Leaf);
        right.set_fences(b"m", b"");

        let payload = [0u8; 200];
        let mut i = 0;
        while left.insert(format!("a{i:04}").as_bytes(), &payload) {
            i += 1;
        }
        let mut j = 0;
        while right.insert(format!("z{j:04}").as_bytes(), &payload) {
            j += 1;
        }

        assert!(merged_image(&left.as_node(), &right.as_node(), None).is_none());
    }

    #[test]
    fn inner_node_stores_child_references() {
        let mut page = Page::zeroed();
        let mut node = NodeMut::init(&mut page, NodeTag::Inner);
        node.set_upper(99);

        node.insert(b"m", &7u32.to_le_bytes());
        node.insert(b"t", &8u32.to_le_bytes());

        let view = node.as_node();
        view.validate().unwrap();
        assert_eq!(view.child(0), 7);
        assert_eq!(view.child(1), 8);
        assert_eq!(view.child(2), 99);

        assert_eq!(view.child(view.lower_bound(b"a").index()), 7);
        assert_eq!(view.child(view.lower_bound(b"m").index()), 7);
        assert_eq!(view.child(view.lower_bound(b"p").index()), 8);
        assert_eq!(view.child(view.lower_bound(b"z").index()), 99);
    }

    #[test]
    fn zero_copy_payload_access() {
        let mut page = leaf_page();
        NodeMut::new(&mut page).insert(b"mykey", b"myvalue");

        let view = Node::new(&page);
        let payload = view.payload(0);
        let payload_ptr = payload.as_ptr() as usize;
        let page_ptr = page.as_bytes().as_ptr() as usize;
        assert!(payload_ptr >= page_ptr && payload_ptr < page_ptr + PAGE_SIZE);
    }
}
