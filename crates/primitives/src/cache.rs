//! Cache stamps carried alongside blocks.

use core::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// How far prefetching has progressed for a cached block.
///
/// The order is meaningful: a block only ever moves forward through
/// these states.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum PrefetchStatus {
    /// No prefetch has been triggered for this block.
    #[default]
    NoPrefetch,
    /// Fetches for the block's children have been enqueued.
    TriggeredPrefetch,
    /// The block's entire subtree is materialized locally.
    FinishedPrefetch,
}

impl Display for PrefetchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoPrefetch => "NoPrefetch",
            Self::TriggeredPrefetch => "TriggeredPrefetch",
            Self::FinishedPrefetch => "FinishedPrefetch",
        })
    }
}

/// How long a cached block should be retained.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum BlockCacheLifetime {
    #[default]
    Transient,
    Permanent,
}
