//! Core data types for the merklefs block store.
//!
//! Everything here is plain data: content-hash identifiers, block
//! pointers, the block sum types that make up file and directory trees,
//! and the cache stamps that travel alongside blocks. Storage, codecs
//! and networking live elsewhere and consume these types.

pub mod block;
pub mod cache;
pub mod hash;
pub mod tlf;
