//! The prefetch coordinator: a single task owning the forest of
//! outstanding prefetch trees.
//!
//! Every node in the forest tracks how many descendant fetches (its own
//! included, until it resolves) must still finish before its subtree is
//! fully materialized. Completion information percolates from the leaves
//! up through parent edges; a node whose count reaches zero is finished,
//! stamped in the caches, and removed.
//!
//! A critical assumption is that the forest never contains a diamond:
//! a block may have multiple parents, but there is at most one directed
//! path between any two blocks. Content addressing guarantees this, since
//! changing any block rewrites every ancestor. A diamond would make a
//! completed fetch below it count twice in everything above it, and the
//! underflow assertions here would eventually fire.

use core::mem;
use core::time::Duration;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use merklefs_primitives::block::{
    Block, BlockKind, BlockPointer, DirBlock, DirEntry, EntryType, FileBlock, IndirectPointer,
};
use merklefs_primitives::cache::{BlockCacheLifetime, PrefetchStatus};
use merklefs_primitives::hash::BlockId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PrefetcherConfig;
use crate::priority::{calculate_priority, DIR_ENTRY_PREFETCH_PRIORITY,
    FILE_INDIRECT_BLOCK_PREFETCH_PRIORITY, LOWEST_TRIGGER_PREFETCH_PRIORITY};
use crate::retriever::{BlockRetriever, FetchHandle, KeyMetadata};

/// How long a round of child fetches may run before the retriever
/// abandons it.
const PREFETCH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// One prefetch trigger, as marshalled onto the event channel.
#[derive(Clone, Debug)]
pub(crate) struct PrefetchRequest {
    pub(crate) ptr: BlockPointer,
    pub(crate) block: Block,
    pub(crate) kmd: Arc<dyn KeyMetadata>,
    pub(crate) priority: i32,
    pub(crate) lifetime: BlockCacheLifetime,
    pub(crate) prefetch_status: PrefetchStatus,
    pub(crate) is_deep_sync: bool,
}

/// One live entry of the prefetch forest.
#[derive(Clone, Debug)]
pub(crate) struct PrefetchNode {
    /// Outstanding fetches in this block's subtree, the block's own
    /// fetch included until it resolves. Zero means finished.
    pub(crate) subtree_block_count: usize,
    /// Whether this block has already expanded and enqueued fetches for
    /// its children.
    pub(crate) subtree_triggered: bool,
    /// The request that materialized this node. Absent while the node
    /// only exists because a parent registered it ahead of its fetch.
    pub(crate) req: Option<PrefetchRequest>,
    /// Back edges to parents in the forest; may go stale and are pruned
    /// on the next walk through them.
    pub(crate) parents: HashSet<BlockId>,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum ExpandError {
    #[error("unknown block type")]
    UnknownBlockType,
}

pub(crate) struct PrefetchCoordinator {
    retriever: Arc<dyn BlockRetriever>,
    config: Arc<dyn PrefetcherConfig>,
    /// The prefetch forest. Owned exclusively by this task; never
    /// touched from anywhere else.
    prefetches: HashMap<BlockId, PrefetchNode>,
    request_rx: mpsc::UnboundedReceiver<PrefetchRequest>,
    cancel_rx: mpsc::UnboundedReceiver<BlockId>,
    fetch_tx: mpsc::UnboundedSender<FetchHandle>,
    almost_done: CancellationToken,
    is_shutting_down: bool,
}

impl PrefetchCoordinator {
    pub(crate) fn new(
        retriever: Arc<dyn BlockRetriever>,
        config: Arc<dyn PrefetcherConfig>,
        request_rx: mpsc::UnboundedReceiver<PrefetchRequest>,
        cancel_rx: mpsc::UnboundedReceiver<BlockId>,
        fetch_tx: mpsc::UnboundedSender<FetchHandle>,
        almost_done: CancellationToken,
    ) -> Self {
        Self {
            retriever,
            config,
            prefetches: HashMap::new(),
            request_rx,
            cancel_rx,
            fetch_tx,
            almost_done,
            is_shutting_down: false,
        }
    }

    /// Runs the event loop until shutdown has been signalled and both
    /// event queues are drained.
    ///
    /// Example of a synced prefetch of `a -> {b -> {c, d}, e -> {f, g}}`
    /// with direct leaves, showing the forest after each event:
    ///
    /// 1. `a` is fetched and expands, triggering `b` and `e`:
    ///    `a:2 -> {b:1, e:1}`
    /// 2. `b` is fetched; its own completion decrements `b` and `a` by
    ///    one, then its expansion adds its two children to both:
    ///    `a:3 -> {b:2 -> {c:1, d:1}, e:1}`
    /// 3. `c` is fetched and is a tail, so it completes up the tree:
    ///    `a:2 -> {b:1 -> {d:1}, e:1}`
    /// 4. `d` likewise: `a:1 -> {e:1}`
    /// 5. `e` is fetched and expands: `a:2 -> {e:2 -> {f:1, g:1}}`
    /// 6. `f` is a tail: `a:1 -> {e:1 -> {g:1}}`
    /// 7. `g` is a tail, completing `g`, `e` and `a`: empty.
    pub(crate) async fn run(mut self) {
        loop {
            if self.is_shutting_down
                && self.request_rx.is_empty()
                && self.cancel_rx.is_empty()
            {
                debug!("prefetch queues drained, stopping");
                return;
            }
            tokio::select! {
                Some(block_id) = self.cancel_rx.recv() => self.handle_cancel(block_id),
                Some(req) = self.request_rx.recv() => self.handle_trigger(req).await,
                () = self.almost_done.cancelled(), if !self.is_shutting_down => {
                    self.is_shutting_down = true;
                }
            }
        }
    }

    pub(crate) fn handle_cancel(&mut self, block_id: BlockId) {
        if !self.prefetches.contains_key(&block_id) {
            return;
        }
        debug!(%block_id, "canceling prefetch");
        self.apply_cancel(block_id);
    }

    pub(crate) async fn handle_trigger(&mut self, req: PrefetchRequest) {
        let block_id = req.ptr.id;
        let is_waiting = self.prefetches.contains_key(&block_id);

        if is_waiting {
            // The node may have been created by a parent ahead of this
            // block's own fetch; attach the request it was missing.
            let pre = self
                .prefetches
                .get_mut(&block_id)
                .expect("waiting prefetch is in the forest");
            if pre.req.is_none() {
                pre.req = Some(req.clone());
            }
        }

        if req.prefetch_status == PrefetchStatus::FinishedPrefetch {
            debug!(%block_id, "prefetch already finished");
            if is_waiting {
                // Decrementing by the node's own count guarantees it is
                // removed from the forest.
                let num_blocks = self
                    .prefetches
                    .get(&block_id)
                    .expect("waiting prefetch is in the forest")
                    .subtree_block_count;
                debug!(%block_id, num_blocks, "completing prefetch");
                let mut finished = Vec::new();
                self.apply_complete(block_id, num_blocks, &mut finished);
                self.flush_finished(finished).await;
            }
            return;
        }
        if req.priority < LOWEST_TRIGGER_PREFETCH_PRIORITY {
            debug!(%block_id, priority = req.priority, "skipping low priority prefetch");
            return;
        }
        if req.prefetch_status == PrefetchStatus::TriggeredPrefetch && !req.is_deep_sync {
            debug!(%block_id, "prefetch already triggered");
            return;
        }

        // A node that is not (or no longer) tracked in the forest. Its
        // expansion still runs; it just completes directly instead of
        // through a walk.
        let mut loose: Option<PrefetchNode> = None;

        if is_waiting {
            let (triggered, count) = {
                let pre = self
                    .prefetches
                    .get(&block_id)
                    .expect("waiting prefetch is in the forest");
                (pre.subtree_triggered, pre.subtree_block_count)
            };
            if triggered {
                debug!(%block_id, "prefetch subtree already triggered");
                if count == 0 {
                    // Only this block is left and no earlier pass ran
                    // through to the tail. Clear it out of the forest;
                    // a deep-sync upgrade below may still re-expand it.
                    let snapshot = self
                        .prefetches
                        .get(&block_id)
                        .expect("waiting prefetch is in the forest")
                        .clone();
                    self.apply_cancel(block_id);
                    loose = Some(snapshot);
                }
                let current = match loose.as_mut() {
                    Some(node) => node.req.as_mut(),
                    None => self
                        .prefetches
                        .get_mut(&block_id)
                        .expect("waiting prefetch is in the forest")
                        .req
                        .as_mut(),
                }
                .expect("a triggered prefetch always carries a request");
                if current.is_deep_sync || !req.is_deep_sync {
                    // Redundant request; children were already enqueued.
                    return;
                }
                current.is_deep_sync = true;
            } else {
                // The block was counted by a parent and has now been
                // fetched; percolate that up the tree.
                assert!(
                    count > 0,
                    "an untriggered prefetch cannot have zero outstanding blocks"
                );
                self.apply_decrement(block_id);
                self.prefetches
                    .get_mut(&block_id)
                    .expect("decrement never removes nodes")
                    .subtree_triggered = true;
            }
        } else {
            loose = Some(PrefetchNode {
                subtree_block_count: 0,
                subtree_triggered: true,
                req: Some(req.clone()),
                parents: HashSet::new(),
            });
        }

        let expand_req = match loose.as_ref() {
            Some(node) => node.req.clone(),
            None => self
                .prefetches
                .get(&block_id)
                .and_then(|pre| pre.req.clone()),
        }
        .expect("a triggered prefetch always carries a request");

        match self.expand_block(block_id, &expand_req) {
            Err(err) => {
                debug!(%block_id, %err, "cannot expand block");
            }
            Ok((_, true)) => {
                debug!(%block_id, "completed prefetch for tail block");
                // Parents may be waiting on this block, so sweep the
                // tree for nodes that have now reached zero. Zero is the
                // right amount here: any decrement for the block's own
                // fetch already happened above.
                let mut finished = Vec::new();
                if self.prefetches.contains_key(&block_id) {
                    self.apply_complete(block_id, 0, &mut finished);
                } else {
                    // Fetched through to completion without ever being
                    // tracked; finish it directly.
                    finished.push((block_id, expand_req));
                }
                self.flush_finished(finished).await;
            }
            Ok((0, _)) => {
                debug!(%block_id, "no new blocks to prefetch");
            }
            Ok((num_blocks, _)) => {
                if !is_waiting {
                    debug!(%block_id, "adding block to the prefetch forest");
                    // The block's own fetch is already done, so it joins
                    // at zero; the walk below accounts for its children.
                    let node = loose.take().expect("untracked prefetch was created above");
                    let _ = self.prefetches.insert(block_id, node);
                }
                debug!(%block_id, num_blocks, "prefetching children");
                self.apply_add(block_id, num_blocks);
            }
        }
    }

    /// Enumerates the children of a just-fetched block, registering each
    /// one in the forest and submitting fetches for those not already on
    /// the wire. Returns how many outstanding blocks the expansion adds
    /// to this block's subtree, and whether the block is a tail.
    fn expand_block(
        &mut self,
        block_id: BlockId,
        req: &PrefetchRequest,
    ) -> Result<(usize, bool), ExpandError> {
        match &req.block {
            Block::File(FileBlock::Direct { .. }) => Ok((0, true)),
            Block::File(FileBlock::Indirect { children }) => {
                Ok(self.expand_indirect(block_id, children, BlockKind::File, req))
            }
            Block::Dir(DirBlock::Indirect { children }) => {
                Ok(self.expand_indirect(block_id, children, BlockKind::Dir, req))
            }
            Block::Dir(DirBlock::Direct { entries }) => {
                Ok(self.expand_dir_entries(block_id, entries, req))
            }
            _ => Err(ExpandError::UnknownBlockType),
        }
    }

    fn expand_indirect(
        &mut self,
        parent_id: BlockId,
        children: &[IndirectPointer],
        kind: BlockKind,
        req: &PrefetchRequest,
    ) -> (usize, bool) {
        let base = calculate_priority(
            FILE_INDIRECT_BLOCK_PREFETCH_PRIORITY,
            self.config.is_synced_tlf(req.kmd.tlf_id()),
        );
        let mut num_blocks = 0;
        for (i, child) in children.iter().enumerate() {
            let (n, need_new_fetch) = self.record_prefetch_parent(child.ptr.id, parent_id);
            num_blocks += n;
            if need_new_fetch {
                self.submit_fetch(base - i as i32, &req.kmd, child.ptr, kind, req.lifetime);
            }
        }
        (num_blocks, children.is_empty())
    }

    fn expand_dir_entries(
        &mut self,
        parent_id: BlockId,
        entries: &BTreeMap<String, DirEntry>,
        req: &PrefetchRequest,
    ) -> (usize, bool) {
        // Small entries first, to minimize time-to-first-useful-byte.
        let mut sorted: Vec<_> = entries.iter().collect();
        sorted.sort_by_key(|(_, entry)| entry.size);

        let base = calculate_priority(
            DIR_ENTRY_PREFETCH_PRIORITY,
            self.config.is_synced_tlf(req.kmd.tlf_id()),
        );
        let mut num_blocks = 0;
        let mut total_eligible = 0_usize;
        for (i, (name, entry)) in sorted.into_iter().enumerate() {
            let priority = base - i as i32;
            let kind = match entry.entry_type {
                EntryType::Dir => BlockKind::Dir,
                EntryType::File | EntryType::Exec => BlockKind::File,
                EntryType::Sym => {
                    debug!(%parent_id, %name, "skipping prefetch for entry without a block");
                    continue;
                }
            };
            total_eligible += 1;
            let (n, need_new_fetch) = self.record_prefetch_parent(entry.ptr.id, parent_id);
            num_blocks += n;
            if need_new_fetch {
                self.submit_fetch(priority, &req.kmd, entry.ptr, kind, req.lifetime);
            }
        }
        (num_blocks, total_eligible == 0)
    }

    /// Registers `parent_id` as a parent of `child_id`, creating the
    /// child node if this is the first time it is seen. Returns how many
    /// outstanding blocks the new edge makes the parent's subtree absorb,
    /// and whether the child still needs a fetch put on the wire.
    fn record_prefetch_parent(
        &mut self,
        child_id: BlockId,
        parent_id: BlockId,
    ) -> (usize, bool) {
        let mut need_new_fetch = false;
        let child = self.prefetches.entry(child_id).or_insert_with(|| {
            // A later trigger for the child decrements this initial
            // count once its own fetch resolves.
            need_new_fetch = true;
            PrefetchNode {
                subtree_block_count: 1,
                subtree_triggered: false,
                req: None,
                parents: HashSet::new(),
            }
        });
        if child.parents.insert(parent_id) {
            (child.subtree_block_count, need_new_fetch)
        } else {
            (0, need_new_fetch)
        }
    }

    fn submit_fetch(
        &mut self,
        priority: i32,
        kmd: &Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        kind: BlockKind,
        lifetime: BlockCacheLifetime,
    ) {
        let handle = self.retriever.request(
            priority,
            Arc::clone(kmd),
            ptr,
            kind,
            lifetime,
            PREFETCH_TIMEOUT,
        );
        if self.fetch_tx.send(handle).is_err() {
            debug!(block_id = %ptr.id, "in-flight tracker is gone, dropping fetch handle");
        }
    }

    /// Post-order walk up the parent DAG: visits every ancestor
    /// reachable from `block_id` before applying `f` to `block_id`
    /// itself, farthest ancestors first. Edges to nodes no longer in the
    /// forest are pruned along the way. With a diamond-free graph each
    /// reachable node is visited exactly once.
    fn apply_to_parents_recursive(
        &mut self,
        block_id: BlockId,
        f: &mut dyn FnMut(&mut Self, BlockId),
    ) {
        let Some(node) = self.prefetches.get_mut(&block_id) else {
            return;
        };
        let parents = mem::take(&mut node.parents);
        let mut live = HashSet::with_capacity(parents.len());
        for parent_id in parents {
            if !self.prefetches.contains_key(&parent_id) {
                continue;
            }
            let _ = live.insert(parent_id);
            self.apply_to_parents_recursive(parent_id, f);
        }
        if let Some(node) = self.prefetches.get_mut(&block_id) {
            node.parents = live;
        }
        f(self, block_id);
    }

    /// Removes every node from `block_id` up through its ancestors.
    fn apply_cancel(&mut self, block_id: BlockId) {
        self.apply_to_parents_recursive(block_id, &mut |this, id| {
            let _ = this.prefetches.remove(&id);
        });
    }

    /// Walks up the tree decrementing each node by one.
    fn apply_decrement(&mut self, block_id: BlockId) {
        self.apply_to_parents_recursive(block_id, &mut |this, id| {
            let Some(node) = this.prefetches.get_mut(&id) else {
                return;
            };
            assert!(
                node.subtree_block_count > 0,
                "prefetch decrement overstepped the subtree count for block {id}"
            );
            node.subtree_block_count -= 1;
        });
    }

    /// Walks up the tree adding `num_blocks` to each node.
    fn apply_add(&mut self, block_id: BlockId, num_blocks: usize) {
        self.apply_to_parents_recursive(block_id, &mut |this, id| {
            if let Some(node) = this.prefetches.get_mut(&id) {
                node.subtree_block_count += num_blocks;
            }
        });
    }

    /// Walks up the tree decrementing each node by `num_blocks`. Nodes
    /// that hit zero are finished: removed from the forest and collected
    /// into `finished` for their terminal cache stamp.
    fn apply_complete(
        &mut self,
        block_id: BlockId,
        num_blocks: usize,
        finished: &mut Vec<(BlockId, PrefetchRequest)>,
    ) {
        self.apply_to_parents_recursive(block_id, &mut |this, id| {
            let Some(node) = this.prefetches.get_mut(&id) else {
                return;
            };
            assert!(
                node.subtree_block_count >= num_blocks,
                "prefetch completion overstepped the subtree count for block {id}"
            );
            node.subtree_block_count -= num_blocks;
            if node.subtree_block_count == 0 {
                let node = this
                    .prefetches
                    .remove(&id)
                    .expect("node was just looked up");
                let req = node
                    .req
                    .expect("a finished prefetch always carries a request");
                finished.push((id, req));
            }
        });
    }

    /// Stamps each finished block `FinishedPrefetch` in the caches. A
    /// failed write downgrades the completion to a cancellation: the
    /// node is already out of the forest, so the stamp is simply lost.
    async fn flush_finished(&self, finished: Vec<(BlockId, PrefetchRequest)>) {
        for (block_id, req) in finished {
            if let Err(err) = self
                .retriever
                .put_in_caches(
                    &req.ptr,
                    req.kmd.tlf_id(),
                    &req.block,
                    req.lifetime,
                    PrefetchStatus::FinishedPrefetch,
                )
                .await
            {
                warn!(
                    %block_id,
                    %err,
                    "failed to complete prefetch due to a cache error, canceled it instead"
                );
            }
        }
    }
}

/// Consumes completion signals for every fetch handed to the retriever.
///
/// On shutdown: finish the backlog queued so far, cancel `almost_done`
/// so the coordinator starts draining its event queues, then keep
/// consuming the fetches it submits while draining. Once the coordinator
/// exits and the channel closes, fire `done`.
pub(crate) async fn track_in_flight_fetches(
    mut fetches: mpsc::UnboundedReceiver<FetchHandle>,
    shutdown: CancellationToken,
    almost_done: CancellationToken,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            Some(fetch) = fetches.recv() => consume_fetch(fetch).await,
            () = shutdown.cancelled() => break,
        }
    }
    while let Ok(fetch) = fetches.try_recv() {
        consume_fetch(fetch).await;
    }
    almost_done.cancel();
    while let Some(fetch) = fetches.recv().await {
        consume_fetch(fetch).await;
    }
    done.cancel();
}

/// Failed fetches surface only here: the affected subtree never
/// completes and stays in the forest until cancelled or shut down.
async fn consume_fetch(fetch: FetchHandle) {
    if let Ok(Err(err)) = fetch.await {
        debug!(%err, "prefetch fetch failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use merklefs_primitives::tlf::TlfId;
    use tokio::sync::oneshot;

    use super::*;
    use crate::priority::DEFAULT_ON_DEMAND_REQUEST_PRIORITY;

    #[derive(Debug)]
    struct TestKmd;

    impl KeyMetadata for TestKmd {
        fn tlf_id(&self) -> TlfId {
            TlfId::default()
        }
    }

    struct StaticSyncPolicy {
        synced: bool,
    }

    impl PrefetcherConfig for StaticSyncPolicy {
        fn is_synced_tlf(&self, _tlf_id: TlfId) -> bool {
            self.synced
        }
    }

    #[derive(Debug, Default)]
    struct RecordingRetriever {
        requests: Mutex<Vec<(i32, BlockId, BlockKind)>>,
        finished: Mutex<Vec<BlockId>>,
        fail_cache: AtomicBool,
    }

    #[async_trait]
    impl BlockRetriever for RecordingRetriever {
        fn request(
            &self,
            priority: i32,
            _kmd: Arc<dyn KeyMetadata>,
            ptr: BlockPointer,
            kind: BlockKind,
            _lifetime: BlockCacheLifetime,
            _timeout: Duration,
        ) -> FetchHandle {
            self.requests
                .lock()
                .expect("requests lock")
                .push((priority, ptr.id, kind));
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            rx
        }

        async fn put_in_caches(
            &self,
            ptr: &BlockPointer,
            _tlf_id: TlfId,
            _block: &Block,
            _lifetime: BlockCacheLifetime,
            status: PrefetchStatus,
        ) -> eyre::Result<()> {
            if self.fail_cache.load(Ordering::SeqCst) {
                eyre::bail!("disk cache is full");
            }
            assert_eq!(status, PrefetchStatus::FinishedPrefetch, "terminal stamp");
            self.finished.lock().expect("finished lock").push(ptr.id);
            Ok(())
        }
    }

    struct Harness {
        coordinator: PrefetchCoordinator,
        retriever: Arc<RecordingRetriever>,
        _request_tx: mpsc::UnboundedSender<PrefetchRequest>,
        _cancel_tx: mpsc::UnboundedSender<BlockId>,
        _fetch_rx: mpsc::UnboundedReceiver<FetchHandle>,
    }

    fn harness(synced: bool) -> Harness {
        let retriever = Arc::new(RecordingRetriever::default());
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let coordinator = PrefetchCoordinator::new(
            Arc::clone(&retriever) as Arc<dyn BlockRetriever>,
            Arc::new(StaticSyncPolicy { synced }),
            request_rx,
            cancel_rx,
            fetch_tx,
            CancellationToken::new(),
        );
        Harness {
            coordinator,
            retriever,
            _request_tx: request_tx,
            _cancel_tx: cancel_tx,
            _fetch_rx: fetch_rx,
        }
    }

    fn id(n: u8) -> BlockId {
        BlockId::from_bytes([n; 32])
    }

    fn block_ptr(n: u8) -> BlockPointer {
        BlockPointer::new(id(n), 1, [0; 8])
    }

    fn direct_file() -> Block {
        Block::File(FileBlock::Direct {
            contents: vec![0; 16],
        })
    }

    fn indirect_dir(children: &[u8]) -> Block {
        Block::Dir(DirBlock::Indirect {
            children: children
                .iter()
                .map(|&n| IndirectPointer {
                    ptr: block_ptr(n),
                    offset: u64::from(n),
                })
                .collect(),
        })
    }

    fn request_at(n: u8, block: Block, status: PrefetchStatus, deep: bool, priority: i32)
        -> PrefetchRequest {
        PrefetchRequest {
            ptr: block_ptr(n),
            block,
            kmd: Arc::new(TestKmd),
            priority,
            lifetime: BlockCacheLifetime::Transient,
            prefetch_status: status,
            is_deep_sync: deep,
        }
    }

    /// An on-demand fetch landing for the first time.
    fn on_demand(n: u8, block: Block, deep: bool) -> PrefetchRequest {
        request_at(
            n,
            block,
            PrefetchStatus::NoPrefetch,
            deep,
            DEFAULT_ON_DEMAND_REQUEST_PRIORITY,
        )
    }

    /// A synced-folder child fetch landing after its prefetch resolved.
    fn synced_child(n: u8, block: Block) -> PrefetchRequest {
        request_at(
            n,
            block,
            PrefetchStatus::TriggeredPrefetch,
            true,
            DEFAULT_ON_DEMAND_REQUEST_PRIORITY - 1,
        )
    }

    fn assert_counts(harness: &Harness, expected: &[(u8, usize)]) {
        assert_eq!(
            harness.coordinator.prefetches.len(),
            expected.len(),
            "forest size"
        );
        for &(n, count) in expected {
            let node = harness
                .coordinator
                .prefetches
                .get(&id(n))
                .unwrap_or_else(|| panic!("block {} is tracked", id(n)));
            assert_eq!(node.subtree_block_count, count, "count of block {}", id(n));
        }
    }

    fn finished_ids(harness: &Harness) -> Vec<BlockId> {
        let mut ids = harness
            .retriever
            .finished
            .lock()
            .expect("finished lock")
            .clone();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn synced_tree_completes_bottom_up() {
        let mut h = harness(true);

        // a -> {b -> {c, d}, e -> {f, g}}, all leaves direct.
        h.coordinator
            .handle_trigger(on_demand(b'a', indirect_dir(&[b'b', b'e']), true))
            .await;
        assert_counts(&h, &[(b'a', 2), (b'b', 1), (b'e', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'b', indirect_dir(&[b'c', b'd'])))
            .await;
        assert_counts(&h, &[(b'a', 3), (b'b', 2), (b'c', 1), (b'd', 1), (b'e', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'c', direct_file()))
            .await;
        assert_counts(&h, &[(b'a', 2), (b'b', 1), (b'd', 1), (b'e', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'd', direct_file()))
            .await;
        assert_counts(&h, &[(b'a', 1), (b'e', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'e', indirect_dir(&[b'f', b'g'])))
            .await;
        assert_counts(&h, &[(b'a', 2), (b'e', 2), (b'f', 1), (b'g', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'f', direct_file()))
            .await;
        assert_counts(&h, &[(b'a', 1), (b'e', 1), (b'g', 1)]);

        h.coordinator
            .handle_trigger(synced_child(b'g', direct_file()))
            .await;
        assert!(h.coordinator.prefetches.is_empty(), "forest is drained");

        let mut expected: Vec<BlockId> =
            [b'a', b'b', b'c', b'd', b'e', b'f', b'g'].map(id).to_vec();
        expected.sort();
        assert_eq!(finished_ids(&h), expected, "every block finished exactly once");

        let requests = h.retriever.requests.lock().expect("requests lock");
        let priorities: Vec<i32> = requests.iter().map(|&(p, _, _)| p).collect();
        assert_eq!(priorities, vec![99, 98, 99, 98, 99, 98], "boosted, earlier wins");
    }

    #[tokio::test]
    async fn cancel_removes_root_and_late_children_are_dropped() {
        let mut h = harness(false);

        h.coordinator
            .handle_trigger(on_demand(b'a', indirect_dir(&[b'b', b'c']), false))
            .await;
        assert_counts(&h, &[(b'a', 2), (b'b', 1), (b'c', 1)]);

        h.coordinator.handle_cancel(id(b'a'));
        assert_counts(&h, &[(b'b', 1), (b'c', 1)]);

        // The children land at the negative priority they were fetched
        // at, below the trigger threshold: nothing happens.
        h.coordinator
            .handle_trigger(request_at(
                b'b',
                direct_file(),
                PrefetchStatus::TriggeredPrefetch,
                false,
                FILE_INDIRECT_BLOCK_PREFETCH_PRIORITY,
            ))
            .await;
        assert_counts(&h, &[(b'b', 1), (b'c', 1)]);
        assert!(finished_ids(&h).is_empty(), "nothing was stamped finished");

        // Explicit cancels prune the stale parent edges and empty the
        // forest.
        h.coordinator.handle_cancel(id(b'b'));
        h.coordinator.handle_cancel(id(b'c'));
        assert!(h.coordinator.prefetches.is_empty());
    }

    #[tokio::test]
    async fn cancel_of_unknown_block_is_a_no_op() {
        let mut h = harness(true);
        h.coordinator.handle_cancel(id(b'z'));
        assert!(h.coordinator.prefetches.is_empty());
    }

    #[tokio::test]
    async fn low_priority_triggers_are_dropped() {
        let mut h = harness(false);
        h.coordinator
            .handle_trigger(request_at(
                b'a',
                indirect_dir(&[b'b']),
                PrefetchStatus::NoPrefetch,
                false,
                -2000,
            ))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        assert!(h.retriever.requests.lock().expect("requests lock").is_empty());
    }

    #[tokio::test]
    async fn finished_trigger_completes_waiting_subtree() {
        let mut h = harness(true);

        // Hand-assemble x:3 under p:5.
        let _ = h.coordinator.prefetches.insert(
            id(b'p'),
            PrefetchNode {
                subtree_block_count: 5,
                subtree_triggered: true,
                req: Some(on_demand(b'p', indirect_dir(&[b'x']), true)),
                parents: HashSet::new(),
            },
        );
        let _ = h.coordinator.prefetches.insert(
            id(b'x'),
            PrefetchNode {
                subtree_block_count: 3,
                subtree_triggered: true,
                req: Some(on_demand(b'x', indirect_dir(&[]), true)),
                parents: [id(b'p')].into_iter().collect(),
            },
        );

        h.coordinator
            .handle_trigger(request_at(
                b'x',
                direct_file(),
                PrefetchStatus::FinishedPrefetch,
                true,
                DEFAULT_ON_DEMAND_REQUEST_PRIORITY,
            ))
            .await;

        assert_counts(&h, &[(b'p', 2)]);
        assert_eq!(finished_ids(&h), vec![id(b'x')]);
    }

    #[tokio::test]
    async fn finished_trigger_for_unknown_block_is_a_no_op() {
        let mut h = harness(true);
        h.coordinator
            .handle_trigger(request_at(
                b'q',
                direct_file(),
                PrefetchStatus::FinishedPrefetch,
                true,
                DEFAULT_ON_DEMAND_REQUEST_PRIORITY,
            ))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        assert!(finished_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn repeated_unsynced_triggers_are_idempotent() {
        let mut h = harness(false);

        h.coordinator
            .handle_trigger(on_demand(b'x', indirect_dir(&[b'y']), false))
            .await;
        assert_counts(&h, &[(b'x', 1), (b'y', 1)]);

        h.coordinator
            .handle_trigger(on_demand(b'x', indirect_dir(&[b'y']), false))
            .await;
        assert_counts(&h, &[(b'x', 1), (b'y', 1)]);
        assert_eq!(
            h.retriever.requests.lock().expect("requests lock").len(),
            1,
            "no duplicate wire fetch"
        );
    }

    #[tokio::test]
    async fn deep_sync_upgrade_re_expands_without_refetching() {
        let mut h = harness(false);

        h.coordinator
            .handle_trigger(on_demand(b'x', indirect_dir(&[b'y']), false))
            .await;
        assert_counts(&h, &[(b'x', 1), (b'y', 1)]);

        h.coordinator
            .handle_trigger(request_at(
                b'x',
                indirect_dir(&[b'y']),
                PrefetchStatus::TriggeredPrefetch,
                true,
                DEFAULT_ON_DEMAND_REQUEST_PRIORITY,
            ))
            .await;

        let node = h
            .coordinator
            .prefetches
            .get(&id(b'x'))
            .expect("x is still tracked");
        assert!(
            node.req.as_ref().expect("x carries a request").is_deep_sync,
            "request was promoted to deep sync"
        );
        assert_counts(&h, &[(b'x', 1), (b'y', 1)]);
        assert_eq!(
            h.retriever.requests.lock().expect("requests lock").len(),
            1,
            "known child was not refetched"
        );
    }

    #[tokio::test]
    async fn direct_file_root_finishes_immediately() {
        let mut h = harness(true);
        h.coordinator
            .handle_trigger(on_demand(b'a', direct_file(), true))
            .await;
        assert!(h.coordinator.prefetches.is_empty(), "never tracked");
        assert_eq!(finished_ids(&h), vec![id(b'a')]);
        assert!(h.retriever.requests.lock().expect("requests lock").is_empty());
    }

    #[tokio::test]
    async fn childless_indirect_block_is_a_tail() {
        let mut h = harness(true);
        h.coordinator
            .handle_trigger(on_demand(b'a', indirect_dir(&[]), true))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        assert_eq!(finished_ids(&h), vec![id(b'a')]);
    }

    #[tokio::test]
    async fn waiting_child_is_backfilled_and_completed() {
        let mut h = harness(true);

        h.coordinator
            .handle_trigger(on_demand(b'a', indirect_dir(&[b'b']), true))
            .await;
        assert_counts(&h, &[(b'a', 1), (b'b', 1)]);
        assert!(
            h.coordinator.prefetches[&id(b'b')].req.is_none(),
            "child known only through its parent"
        );

        // The child arrives already finished: its request is backfilled
        // and the whole chain completes.
        h.coordinator
            .handle_trigger(request_at(
                b'b',
                direct_file(),
                PrefetchStatus::FinishedPrefetch,
                true,
                DEFAULT_ON_DEMAND_REQUEST_PRIORITY - 1,
            ))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        let mut expected = vec![id(b'a'), id(b'b')];
        expected.sort();
        assert_eq!(finished_ids(&h), expected);
    }

    #[tokio::test]
    async fn opaque_blocks_do_not_expand() {
        let mut h = harness(true);
        h.coordinator
            .handle_trigger(on_demand(b'a', Block::Opaque(vec![0xde, 0xad]), true))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        assert!(h.retriever.requests.lock().expect("requests lock").is_empty());
        assert!(finished_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn dir_entries_prefetch_smallest_first() {
        let mut h = harness(false);

        let mut entries = BTreeMap::new();
        let mut entry = |name: &str, entry_type, n: u8, size| {
            let _ = entries.insert(
                name.to_owned(),
                DirEntry {
                    entry_type,
                    ptr: block_ptr(n),
                    size,
                },
            );
        };
        entry("big", EntryType::File, 3, 300);
        entry("small", EntryType::File, 1, 10);
        entry("sub", EntryType::Dir, 2, 50);
        entry("tool", EntryType::Exec, 4, 100);
        entry("link", EntryType::Sym, 9, 5);

        h.coordinator
            .handle_trigger(on_demand(
                b'a',
                Block::Dir(DirBlock::Direct { entries }),
                false,
            ))
            .await;

        // Sorted by size the symlink comes first and is skipped, but it
        // still consumes a priority slot.
        let requests = h.retriever.requests.lock().expect("requests lock").clone();
        assert_eq!(
            requests,
            vec![
                (DIR_ENTRY_PREFETCH_PRIORITY - 1, id(1), BlockKind::File),
                (DIR_ENTRY_PREFETCH_PRIORITY - 2, id(2), BlockKind::Dir),
                (DIR_ENTRY_PREFETCH_PRIORITY - 3, id(4), BlockKind::File),
                (DIR_ENTRY_PREFETCH_PRIORITY - 4, id(3), BlockKind::File),
            ]
        );
        assert_counts(&h, &[(b'a', 4), (1, 1), (2, 1), (3, 1), (4, 1)]);
    }

    #[tokio::test]
    async fn symlink_only_directory_is_a_tail() {
        let mut h = harness(true);

        let mut entries = BTreeMap::new();
        let _ = entries.insert(
            "link".to_owned(),
            DirEntry {
                entry_type: EntryType::Sym,
                ptr: block_ptr(9),
                size: 5,
            },
        );

        h.coordinator
            .handle_trigger(on_demand(b'a', Block::Dir(DirBlock::Direct { entries }), true))
            .await;
        assert!(h.coordinator.prefetches.is_empty());
        assert_eq!(finished_ids(&h), vec![id(b'a')]);
    }

    #[tokio::test]
    async fn failed_terminal_cache_write_is_swallowed() {
        let mut h = harness(true);
        h.retriever.fail_cache.store(true, Ordering::SeqCst);

        h.coordinator
            .handle_trigger(on_demand(b'a', direct_file(), true))
            .await;

        // The completion is downgraded to a cancellation; the forest is
        // clean either way.
        assert!(h.coordinator.prefetches.is_empty());
        assert!(finished_ids(&h).is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "untriggered prefetch")]
    async fn zero_count_untriggered_node_panics() {
        let mut h = harness(true);
        let _ = h.coordinator.prefetches.insert(
            id(b'x'),
            PrefetchNode {
                subtree_block_count: 0,
                subtree_triggered: false,
                req: None,
                parents: HashSet::new(),
            },
        );
        h.coordinator
            .handle_trigger(on_demand(b'x', direct_file(), true))
            .await;
    }

    #[tokio::test]
    async fn tracker_consumes_stragglers_after_drain_token() {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let almost_done = CancellationToken::new();
        let done = CancellationToken::new();

        let tracker = tokio::spawn(track_in_flight_fetches(
            fetch_rx,
            shutdown.clone(),
            almost_done.clone(),
            done.clone(),
        ));

        let (tx, rx) = oneshot::channel();
        fetch_tx.send(rx).expect("tracker is listening");
        let _ = tx.send(Ok(()));

        shutdown.cancel();
        almost_done.cancelled().await;
        assert!(!done.is_cancelled(), "coordinator still owns the channel");

        // A fetch submitted while the coordinator drains its queues.
        let (tx, rx) = oneshot::channel();
        fetch_tx.send(rx).expect("tracker still consumes");
        let _ = tx.send(Ok(()));

        drop(fetch_tx);
        done.cancelled().await;
        tracker.await.expect("tracker exits cleanly");
    }
}
