//! # Spindle Configuration Constants
//!
//! This module centralizes the crate's layout and threshold constants.
//! Constants that depend on each other are co-located and the relationships
//! are enforced through compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> MAX_KV_SIZE (derived: PAGE_SIZE / 4)
//!       │     Upper bound on key + payload size for a single entry. Keeping
//!       │     entries at or below a quarter page guarantees a freshly split
//!       │     leaf always has room for the entry that triggered the split.
//!       │
//!       └─> UNDERFULL_FREE_SPACE (derived: 3/4 of PAGE_SIZE)
//!             A node whose free space after compaction reaches this value
//!             becomes a merge candidate. With splits producing two roughly
//!             half-full nodes, fill factors settle between 50% and 75%.
//!
//! HINT_COUNT (16)
//!       │
//!       └─> Search hints are consulted only when a node holds more than
//!           2 * HINT_COUNT slots; below that a plain binary search over the
//!           whole slot array is already cheap.
//! ```
//!
//! ## Changing PAGE_SIZE
//!
//! The slot and header encodings use 16-bit offsets, so the layout is valid
//! for page sizes up to 65536 bytes. Both derived constants scale with
//! `PAGE_SIZE` automatically.

/// Size of every tree node in bytes. Each node occupies exactly one page.
pub const PAGE_SIZE: usize = 4096;

/// Number of sampled key heads kept per node to narrow binary searches.
pub const HINT_COUNT: usize = 16;

/// Maximum combined size of one key and its payload.
pub const MAX_KV_SIZE: usize = PAGE_SIZE / 4;

/// Merge threshold: a node is underfull once its free space after
/// compaction reaches this many bytes.
pub const UNDERFULL_FREE_SPACE: usize = PAGE_SIZE / 4 * 3;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PAGE_SIZE >= 512, "page must hold a header plus several entries");
    assert!(PAGE_SIZE <= 65536, "slot offsets are 16-bit");
    assert!(MAX_KV_SIZE == PAGE_SIZE / 4);
    assert!(UNDERFULL_FREE_SPACE < PAGE_SIZE);
    assert!(UNDERFULL_FREE_SPACE > PAGE_SIZE / 2);
    assert!(HINT_COUNT > 0);
};
