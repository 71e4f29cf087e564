//! The public prefetcher handle.

use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use merklefs_primitives::block::{Block, BlockPointer};
use merklefs_primitives::cache::{BlockCacheLifetime, PrefetchStatus};
use merklefs_primitives::hash::BlockId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PrefetcherConfig;
use crate::coordinator::{track_in_flight_fetches, PrefetchCoordinator, PrefetchRequest};
use crate::priority::LOWEST_TRIGGER_PREFETCH_PRIORITY;
use crate::retriever::{BlockRetriever, KeyMetadata};

/// Thread-safe handle to the prefetch coordinator.
///
/// Cheap to clone; all clones talk to the same coordinator task.
/// Triggers and cancels are asynchronous notifications: they enqueue an
/// event and return, without waiting for the coordinator to act on it.
#[derive(Clone)]
pub struct BlockPrefetcher {
    config: Arc<dyn PrefetcherConfig>,
    retriever: Arc<dyn BlockRetriever>,
    request_tx: mpsc::UnboundedSender<PrefetchRequest>,
    cancel_tx: mpsc::UnboundedSender<BlockId>,
    /// Idempotently cancelled by [`shutdown`](Self::shutdown).
    shutdown: CancellationToken,
    /// Cancelled once all fetches in flight at shutdown have finished.
    almost_done: CancellationToken,
    /// Cancelled once the coordinator has fully quiesced.
    done: CancellationToken,
}

impl BlockPrefetcher {
    /// Spawns the coordinator and its in-flight fetch tracker. Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn new(retriever: Arc<dyn BlockRetriever>, config: Arc<dyn PrefetcherConfig>) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let almost_done = CancellationToken::new();
        let done = CancellationToken::new();

        let coordinator = PrefetchCoordinator::new(
            Arc::clone(&retriever),
            Arc::clone(&config),
            request_rx,
            cancel_rx,
            fetch_tx,
            almost_done.clone(),
        );
        drop(tokio::spawn(coordinator.run()));
        drop(tokio::spawn(track_in_flight_fetches(
            fetch_rx,
            shutdown.clone(),
            almost_done.clone(),
            done.clone(),
        )));

        Self {
            config,
            retriever,
            request_tx,
            cancel_tx,
            shutdown,
            almost_done,
            done,
        }
    }

    /// Triggers a prefetch for `block` if appropriate.
    ///
    /// Called with every block that lands from the retriever, whether it
    /// arrived on demand or speculatively. The block is (re)stamped in
    /// the caches here; expansion of its children happens later on the
    /// coordinator task.
    pub async fn trigger_prefetch(
        &self,
        ptr: BlockPointer,
        block: Block,
        kmd: Arc<dyn KeyMetadata>,
        priority: i32,
        lifetime: BlockCacheLifetime,
        prefetch_status: PrefetchStatus,
    ) {
        let is_deep_sync = self.config.is_synced_tlf(kmd.tlf_id());
        let req = PrefetchRequest {
            ptr,
            block,
            kmd,
            priority,
            lifetime,
            prefetch_status,
            is_deep_sync,
        };
        if prefetch_status == PrefetchStatus::FinishedPrefetch {
            // Already cached as finished; nothing to write.
        } else if priority < LOWEST_TRIGGER_PREFETCH_PRIORITY {
            // Too low to trigger anything, but the block itself still
            // gets cached, with its status unchanged.
            if let Err(err) = self
                .retriever
                .put_in_caches(&req.ptr, req.kmd.tlf_id(), &req.block, lifetime, prefetch_status)
                .await
            {
                debug!(block_id = %req.ptr.id, %err, "failed to cache low priority block");
            }
        } else if self
            .cache_or_cancel_prefetch(&req, PrefetchStatus::TriggeredPrefetch)
            .await
            .is_err()
        {
            return;
        }
        self.enqueue_trigger(req);
    }

    /// Cancels the named prefetch and everything above it in its tree.
    /// Best effort: fetches already on the wire keep running and their
    /// results are discarded.
    pub fn cancel_prefetch(&self, block_id: BlockId) {
        // Cancels stay valid through most of shutdown; only once the
        // in-flight drain has finished is there nothing left to cancel.
        if self.almost_done.is_cancelled() {
            info!(%block_id, "skipping cancel, prefetcher has drained");
            return;
        }
        if self.cancel_tx.send(block_id).is_err() {
            info!(%block_id, "skipping cancel, prefetcher is gone");
        }
    }

    /// Initiates shutdown (idempotently) and returns a token that fires
    /// once the coordinator has quiesced: all in-flight fetches
    /// consumed, all queued events processed.
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.cancel();
        self.done.clone()
    }

    /// The shutdown signal itself, for observers.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Writes `block` to the caches stamped with `status`; on failure
    /// the prefetch is cancelled instead.
    async fn cache_or_cancel_prefetch(
        &self,
        req: &PrefetchRequest,
        status: PrefetchStatus,
    ) -> eyre::Result<()> {
        let result = self
            .retriever
            .put_in_caches(&req.ptr, req.kmd.tlf_id(), &req.block, req.lifetime, status)
            .await;
        if let Err(err) = &result {
            warn!(block_id = %req.ptr.id, %err, "error caching block, canceling its prefetch");
            self.cancel_prefetch(req.ptr.id);
        }
        result
    }

    fn enqueue_trigger(&self, req: PrefetchRequest) {
        if self.shutdown.is_cancelled() {
            warn!(
                block_id = %req.ptr.id,
                "skipping prefetch, the prefetcher is shut down"
            );
            return;
        }
        if self.request_tx.send(req).is_err() {
            warn!("skipping prefetch, the prefetcher is gone");
        }
    }
}

impl Debug for BlockPrefetcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPrefetcher")
            .field("is_shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
