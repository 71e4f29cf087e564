//! Block trees.
//!
//! Files and directories are encoded as trees of immutable blocks. An
//! indirect block carries an ordered list of pointers to its children; a
//! direct block carries the payload itself (file bytes, or a map of
//! directory entries). Modifying any block changes its content hash and
//! therefore the hash of every ancestor, so two distinct blocks can never
//! share a descendant through more than one path.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::hash::BlockId;

/// Locator for a block: its id plus what the fetch path needs to find
/// and decrypt it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: u32,
    pub ref_nonce: [u8; 8],
}

impl BlockPointer {
    #[must_use]
    pub const fn new(id: BlockId, key_gen: u32, ref_nonce: [u8; 8]) -> Self {
        Self {
            id,
            key_gen,
            ref_nonce,
        }
    }
}

/// Pointer from an indirect block to one of its children, ordered by the
/// child's offset within the parent's logical extent.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct IndirectPointer {
    pub ptr: BlockPointer,
    pub offset: u64,
}

/// Type tag of a directory entry.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    /// Symlinks carry their target inline and reference no block.
    Sym,
}

/// One entry of a direct directory block.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct DirEntry {
    pub entry_type: EntryType,
    pub ptr: BlockPointer,
    /// Total size in bytes of the entry's contents.
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum FileBlock {
    Direct { contents: Vec<u8> },
    Indirect { children: Vec<IndirectPointer> },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum DirBlock {
    Direct { entries: BTreeMap<String, DirEntry> },
    Indirect { children: Vec<IndirectPointer> },
}

/// A decoded block.
///
/// `Opaque` preserves payloads this schema version does not understand;
/// they can be stored and served but not traversed.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
    Opaque(Vec<u8>),
}

/// The decode shape expected for a block about to be fetched.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum BlockKind {
    File,
    Dir,
}

impl Block {
    #[must_use]
    pub const fn kind(&self) -> Option<BlockKind> {
        match self {
            Self::File(_) => Some(BlockKind::File),
            Self::Dir(_) => Some(BlockKind::Dir),
            Self::Opaque(_) => None,
        }
    }

    /// True for blocks whose payload is a list of child pointers.
    #[must_use]
    pub const fn is_indirect(&self) -> bool {
        matches!(
            self,
            Self::File(FileBlock::Indirect { .. }) | Self::Dir(DirBlock::Indirect { .. })
        )
    }
}
