//! Wire-format primitives.
//!
//! Everything on the wire and in the store is built from the same few
//! shapes: big-endian fixed-width integers, `len:u32 ‖ bytes` byte arrays,
//! and `count:u32 ‖ elements` sequences. [`Packer`] writes them with sticky
//! error accumulation; [`Unpacker`] reads them back with typed errors.

mod packer;

pub use packer::{PackError, Packer, UnpackError, Unpacker};

/// Upper bound on an encoded variable-length field, in bytes.
pub const MAX_FIELD_LEN: usize = 1 << 21;
