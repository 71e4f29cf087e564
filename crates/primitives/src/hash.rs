//! Content-hash block identifiers.

use core::fmt::{self, Debug, Display, Formatter};
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Identifier of an immutable block: the SHA-256 digest of its encoded
/// payload. Blocks are content addressed, so two blocks with the same id
/// are the same block.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Default,
)]
pub struct BlockId([u8; Self::LENGTH]);

impl BlockId {
    pub const LENGTH: usize = 32;

    /// Hashes `data` into a block id.
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidBlockId {
    #[error("invalid base58 encoding: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

impl FromStr for BlockId {
    type Err = InvalidBlockId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes: [u8; Self::LENGTH] =
            bytes
                .try_into()
                .map_err(|bytes: Vec<u8>| InvalidBlockId::Length {
                    expected: Self::LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BlockIdVisitor;

        impl Visitor<'_> for BlockIdVisitor {
            type Value = BlockId;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a base58-encoded block id")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(BlockIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_sha256() {
        let id = BlockId::digest(b"Hello World");

        assert_eq!(
            hex::encode(id.as_bytes()),
            "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        );
    }

    #[test]
    fn display_round_trips() {
        let id = BlockId::digest(b"Hello World");

        let parsed: BlockId = id.to_string().parse().expect("rendered id must parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = "3mJr7AoUXx2Wqd".parse::<BlockId>().expect_err("too short");
        assert!(matches!(err, InvalidBlockId::Length { .. }), "{err}");
    }

    #[test]
    fn serde_uses_base58_strings() {
        let id = BlockId::digest(b"Hello World");

        let encoded = serde_json::to_string(&id).expect("serialize");
        assert_eq!(encoded, format!("\"{id}\""));

        let decoded: BlockId = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, id);
    }
}
