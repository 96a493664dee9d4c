//! The 20-byte validator identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::cb58::{cb58_decode, cb58_encode, Cb58Error};
use crate::hashing::{hash160, hash256};
use crate::NODE_ID_LEN;

/// String prefix on the display form of a [`NodeId`].
pub const NODE_ID_PREFIX: &str = "NodeID-";

/// A 20-byte validator identity, `RIPEMD160(SHA256(cert_der))`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// Errors produced while parsing a [`NodeId`].
#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error(transparent)]
    Cb58(#[from] Cb58Error),

    #[error("expected {NODE_ID_LEN} bytes, got {0}")]
    WrongLength(usize),

    #[error("missing {NODE_ID_PREFIX} prefix")]
    MissingPrefix,
}

impl NodeId {
    /// The all-zero node id.
    pub const EMPTY: Self = Self([0u8; NODE_ID_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a node id from a slice; errors unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeIdError> {
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeIdError::WrongLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Derives the node id from a DER-encoded TLS certificate.
    #[must_use]
    pub fn from_cert(cert_der: &[u8]) -> Self {
        Self(hash160(&hash256(cert_der)))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_ID_PREFIX}{}", cb58_encode(&self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s
            .strip_prefix(NODE_ID_PREFIX)
            .ok_or(NodeIdError::MissingPrefix)?;
        Self::from_slice(&cb58_decode(stripped)?)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
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
