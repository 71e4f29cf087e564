//! The block retrieval interface the prefetcher drives.

use core::fmt::Debug;
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use merklefs_primitives::block::{Block, BlockKind, BlockPointer};
use merklefs_primitives::cache::{BlockCacheLifetime, PrefetchStatus};
use merklefs_primitives::tlf::TlfId;
use tokio::sync::oneshot;

/// Completion signal for one fetch handed to the retriever. Yields the
/// fetch outcome exactly once; a dropped sender counts as completion.
pub type FetchHandle = oneshot::Receiver<eyre::Result<()>>;

/// Metadata a fetch needs beyond the block pointer itself (at minimum,
/// which folder the block belongs to). Opaque to the prefetcher except
/// for the folder id.
pub trait KeyMetadata: Send + Sync + Debug {
    fn tlf_id(&self) -> TlfId;
}

/// Issues block fetches and writes finished blocks into the caches.
///
/// `request` must not block: it enqueues the fetch and returns a handle
/// that resolves when the fetch finishes. The retriever caches fetched
/// blocks itself; the prefetcher only ever writes to the caches through
/// [`put_in_caches`](Self::put_in_caches) to update prefetch stamps.
#[async_trait]
pub trait BlockRetriever: Send + Sync {
    /// Starts an asynchronous fetch of `ptr`, decoded as `kind`, to be
    /// abandoned if it has not finished within `timeout`.
    fn request(
        &self,
        priority: i32,
        kmd: Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        kind: BlockKind,
        lifetime: BlockCacheLifetime,
        timeout: Duration,
    ) -> FetchHandle;

    /// Idempotently writes `block` into the memory and disk caches,
    /// stamping it with `status`.
    async fn put_in_caches(
        &self,
        ptr: &BlockPointer,
        tlf_id: TlfId,
        block: &Block,
        lifetime: BlockCacheLifetime,
        status: PrefetchStatus,
    ) -> eyre::Result<()>;
}
