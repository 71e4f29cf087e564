//! Speculative block prefetching.
//!
//! When an application fetches a block that references children, the
//! prefetcher fetches the descendants in the background, caches them,
//! and records when an entire subtree has been materialized so that
//! "prefetch complete" can be reported on any ancestor.
//!
//! The crate is pure coordination: fetching and caching are delegated to
//! an injected [`BlockRetriever`], and sync policy to an injected
//! [`PrefetcherConfig`]. All bookkeeping lives in a single event-loop
//! task that owns the forest of outstanding prefetch trees; callers talk
//! to it through the cloneable [`BlockPrefetcher`] handle.
//!
//! ```ignore
//! let prefetcher = BlockPrefetcher::new(retriever, config);
//!
//! prefetcher
//!     .trigger_prefetch(ptr, block, kmd, priority, lifetime, status)
//!     .await;
//!
//! // later
//! prefetcher.shutdown().cancelled().await;
//! ```

pub mod config;
mod coordinator;
pub mod prefetcher;
pub mod priority;
pub mod retriever;

pub use config::PrefetcherConfig;
pub use prefetcher::BlockPrefetcher;
pub use retriever::{BlockRetriever, FetchHandle, KeyMetadata};

/// Advisory upper bound on live prefetch nodes. Not enforced; callers
/// issuing more outstanding prefetches than this should expect memory
/// pressure.
pub const MAX_NUM_PREFETCHES: usize = 10_000;
