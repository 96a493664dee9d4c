//! Identifier types for the firn consensus stack.
//!
//! Two identifier widths are used throughout the node:
//! - [`Id`]: a 32-byte content address (the SHA-256 of an entity's canonical
//!   bytes) naming vertices, transactions and chains.
//! - [`NodeId`]: a 20-byte validator identity derived from the node's TLS
//!   certificate.
//!
//! Both render as CB58 (Base58 with a 4-byte checksum) for human-readable
//! display and parse back from that form.

mod cb58;
mod hashing;
mod id;
mod node_id;

pub use cb58::{cb58_decode, cb58_encode, Cb58Error};
pub use hashing::{hash160, hash256, checksum};
pub use id::{Id, IdError};
pub use node_id::{NodeId, NodeIdError};

/// Width of an [`Id`] in bytes.
pub const ID_LEN: usize = 32;

/// Width of a [`NodeId`] in bytes.
pub const NODE_ID_LEN: usize = 20;
