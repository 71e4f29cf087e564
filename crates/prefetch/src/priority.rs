//! Fetch priority policy.
//!
//! Priorities are plain integers; higher wins. On-demand reads sit at
//! [`DEFAULT_ON_DEMAND_REQUEST_PRIORITY`], and speculative child fetches
//! run far below them so they never starve interactive traffic. Within
//! one expansion, the i-th child is requested at `base - i` so earlier
//! children win ties.
//!
//! A completed fetch re-enters the prefetcher carrying the priority it
//! was requested at. Only priorities at or above
//! [`LOWEST_TRIGGER_PREFETCH_PRIORITY`] trigger another round of
//! expansion, which is what keeps unsynced folders at a single level of
//! speculation: their child fetches come back at negative priorities and
//! stop there. Synced folders are boosted above that threshold and
//! recurse to the leaves.

/// Priority of an on-demand (application-blocking) block request.
pub const DEFAULT_ON_DEMAND_REQUEST_PRIORITY: i32 = 100;

/// Minimum priority at which a completed fetch triggers further
/// expansion of its children.
pub const LOWEST_TRIGGER_PREFETCH_PRIORITY: i32 = 1;

/// Base priority for children of an indirect block.
pub const FILE_INDIRECT_BLOCK_PREFETCH_PRIORITY: i32 = -100;

/// Base priority for entries of a direct directory block.
pub const DIR_ENTRY_PREFETCH_PRIORITY: i32 = -200;

/// Priority for prefetches spawned by metadata-update pointers.
pub const UPDATE_POINTER_PREFETCH_PRIORITY: i32 = 0;

/// Priority for prefetches with no better-informed caller.
pub const DEFAULT_PREFETCH_PRIORITY: i32 = -1024;

/// Picks the fetch priority for a child block: folders marked synced
/// jump the queue to just below on-demand traffic, everything else keeps
/// its base priority.
#[must_use]
pub const fn calculate_priority(base_priority: i32, is_synced_tlf: bool) -> i32 {
    if is_synced_tlf {
        DEFAULT_ON_DEMAND_REQUEST_PRIORITY - 1
    } else {
        base_priority
    }
}
