//! The 32-byte content-addressed identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::cb58::{cb58_decode, cb58_encode, Cb58Error};
use crate::hashing::hash256;
use crate::ID_LEN;

/// A 32-byte identifier naming a vertex, transaction, chain or poll choice.
///
/// Ids are content addresses: the SHA-256 of the entity's canonical bytes.
/// The string form is CB58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Id([u8; ID_LEN]);

/// Errors produced while parsing an [`Id`].
#[derive(Debug, Error)]
pub enum IdError {
    #[error(transparent)]
    Cb58(#[from] Cb58Error),

    #[error("expected {ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

impl Id {
    /// The all-zero id.
    pub const EMPTY: Self = Self([0u8; ID_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an id from a slice; errors unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdError::WrongLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// The content address of `bytes`.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(hash256(bytes))
    }

    /// Derives a distinct id by hashing this id behind a numeric prefix.
    /// Handy for generating families of related test ids.
    #[must_use]
    pub fn prefixed(&self, prefix: u64) -> Self {
        let mut buf = Vec::with_capacity(8 + ID_LEN);
        buf.extend_from_slice(&prefix.to_be_bytes());
        buf.extend_from_slice(&self.0);
        Self::of(&buf)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&cb58_encode(&self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(&cb58_decode(s)?)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&cb58_encode(&self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}
