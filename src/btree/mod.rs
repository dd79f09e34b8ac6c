//! # B+Tree Index Implementation
//!
//! This module implements the crate's core: a B+tree whose nodes are
//! fixed-size slotted pages with prefix-truncated keys.
//!
//! ## Architecture Overview
//!
//! Leaf and inner nodes share one page layout and are distinguished by a tag
//! byte at offset 0. Each page stores its keys truncated against the common
//! prefix of its two fence keys, keeps a 4-byte order-preserving head per
//! slot for cheap comparisons, and samples heads into a small hint array
//! that narrows binary searches on full pages.
//!
//! ## Node Types
//!
//! - **Leaf Nodes**: store the key/payload pairs. Payload bytes are opaque
//!   to the page and returned to callers as borrowed slices.
//!
//! - **Inner Nodes**: store separator keys whose payloads are child page
//!   references, plus one extra `upper` child in the header. The child at
//!   position i holds the keys in the half-open range between the
//!   surrounding separators.
//!
//! ## Structural Changes
//!
//! Splits and merges build the new page images in scratch buffers and
//! overwrite their targets in one step. The page being split keeps its pool
//! identity as the right sibling, so the parent's existing child reference
//! never has to be rewritten; merging frees the left sibling and overwrites
//! the right one. The tree coordinator re-descends from the root whenever a
//! structural change needs more room further up.
//!
//! ## Key Search
//!
//! 1. Compare the search key against the page prefix; keys outside the
//!    prefix range resolve to the page boundaries
//! 2. Narrow the slot range with the hint array (pages above 32 slots)
//! 3. Binary search comparing the 4-byte head, then key bytes on head ties

pub mod node;
pub mod tree;

pub use node::{
    key_head, merged_image, KeyBuf, Node, NodeMut, NodeTag, SearchResult, SeparatorInfo, Slot,
    CHILD_REF_SIZE, HEADER_SIZE, SLOT_SIZE,
};
pub use tree::{BTree, TreeStats};
