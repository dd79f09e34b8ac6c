//! # Spindle - In-Memory Ordered Byte-Key Index
//!
//! Spindle is an in-memory ordered key-value index organized as a B+tree of
//! fixed-size slotted pages. It maps variable-length byte keys to
//! variable-length byte payloads and supports point lookup, insertion,
//! removal, and ordered scans in both directions.
//!
//! The design prioritizes:
//!
//! - **Compact pages**: every node occupies exactly one 4KB page; keys are
//!   prefix-truncated against the page's fence keys so shared prefixes are
//!   stored once per page instead of once per key
//! - **Fast key search**: each slot carries a 4-byte order-preserving key
//!   head, so most binary-search steps are a single integer comparison; a
//!   sampled hint array narrows the search range on full pages
//! - **Zero-copy reads**: lookups return slices pointing directly into the
//!   page that holds the entry
//!
//! ## Quick Start
//!
//! ```
//! use spindle::BTree;
//!
//! let mut tree = BTree::new();
//! tree.insert(b"apple", b"fruit").unwrap();
//! tree.insert(b"beet", b"root").unwrap();
//!
//! assert_eq!(tree.lookup(b"apple"), Some(&b"fruit"[..]));
//! assert!(tree.remove(b"beet"));
//! assert_eq!(tree.lookup(b"beet"), None);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (BTree)           │
//! ├─────────────────────────────────────┤
//! │  Tree Coordinator (descent, split,  │
//! │  merge, scan re-seeding)            │
//! ├─────────────────────────────────────┤
//! │  Node Layer (slotted page layout,   │
//! │  key heads, hints, compaction)      │
//! ├─────────────────────────────────────┤
//! │        Page Pool (arena)            │
//! └─────────────────────────────────────┘
//! ```
//!
//! All tree state lives in pages owned by a [`pool::PagePool`]. Inner nodes
//! reference their children by pool index rather than by pointer, which keeps
//! the page format position-independent and the tree code free of raw
//! pointers.
//!
//! ## Module Overview
//!
//! - [`btree`]: node layout, per-page algorithms, and the tree coordinator
//! - [`pool`]: page buffer type and the arena that owns every page
//! - [`config`]: page-size and threshold constants with their invariants
//!
//! ## Limits
//!
//! A single entry (key plus payload) may use at most a quarter of a page
//! ([`config::MAX_KV_SIZE`]). Inserting a larger entry is rejected with an
//! error. Duplicate keys are accepted and stored as additional slots; callers
//! that need overwrite semantics remove before inserting.
//!
//! ## Thread Safety
//!
//! `BTree` is a single-threaded structure with no interior locking. Wrap it
//! in a lock for concurrent use.

pub mod btree;
pub mod config;
pub mod pool;

pub use btree::{BTree, TreeStats};
