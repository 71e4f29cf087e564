//! Configuration consumed by the prefetcher.

use merklefs_primitives::tlf::TlfId;

/// Sync policy oracle.
///
/// The prefetcher consults this to decide whether a folder's contents
/// should be aggressively prefetched all the way down (a "synced"
/// folder) or only one level at a time.
pub trait PrefetcherConfig: Send + Sync {
    fn is_synced_tlf(&self, tlf_id: TlfId) -> bool;
}
