//! Top-level folder identifiers.

use core::fmt::{self, Debug, Display, Formatter};
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Identifier of a top-level folder (TLF), the unit over which sync
/// policy is configured.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Default,
)]
pub struct TlfId([u8; Self::LENGTH]);

impl TlfId {
    pub const LENGTH: usize = 16;

    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl Display for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl Debug for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({self})")
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidTlfId {
    #[error("invalid base58 encoding: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

impl FromStr for TlfId {
    type Err = InvalidTlfId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes: [u8; Self::LENGTH] =
            bytes
                .try_into()
                .map_err(|bytes: Vec<u8>| InvalidTlfId::Length {
                    expected: Self::LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl Serialize for TlfId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TlfId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TlfIdVisitor;

        impl Visitor<'_> for TlfIdVisitor {
            type Value = TlfId;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a base58-encoded folder id")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(TlfIdVisitor)
    }
}
