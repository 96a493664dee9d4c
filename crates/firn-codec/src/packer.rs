//! Binary packing and unpacking.

use thiserror::Error;

use crate::MAX_FIELD_LEN;

/// Errors accumulated while packing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("field of {len} bytes exceeds the {max} byte limit")]
    FieldTooLong { len: usize, max: usize },

    #[error("packed size would exceed the {max} byte limit")]
    SizeExceeded { max: usize },
}

/// Errors surfaced while unpacking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("needed {needed} more bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },

    #[error("length marker {len} exceeds the {max} byte limit")]
    FieldTooLong { len: usize, max: usize },

    #[error("{0} is not a boolean byte")]
    BadBool(u8),

    #[error("{0} is not a known tag byte")]
    BadTag(u8),

    #[error("{0} trailing bytes after the final field")]
    TrailingBytes(usize),
}

/// Serializes fields into a byte buffer.
///
/// Write errors stick: after the first failure every further write is a
/// no-op, and [`Packer::finish`] reports the failure. Multi-byte integers
/// are big-endian.
#[derive(Debug)]
pub struct Packer {
    buf: Vec<u8>,
    limit: usize,
    failed: Option<PackError>,
}

impl Packer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A packer that refuses to grow beyond `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            failed: None,
        }
    }

    fn reserve(&mut self, extra: usize) -> bool {
        if self.failed.is_some() {
            return false;
        }
        if self.buf.len().saturating_add(extra) > self.limit {
            self.failed = Some(PackError::SizeExceeded { max: self.limit });
            return false;
        }
        true
    }

    pub fn pack_u8(&mut self, v: u8) {
        if self.reserve(1) {
            self.buf.push(v);
        }
    }

    pub fn pack_u16(&mut self, v: u16) {
        if self.reserve(2) {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    pub fn pack_u32(&mut self, v: u32) {
        if self.reserve(4) {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    pub fn pack_u64(&mut self, v: u64) {
        if self.reserve(8) {
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    pub fn pack_bool(&mut self, v: bool) {
        self.pack_u8(u8::from(v));
    }

    /// Writes `bytes` verbatim, with no length marker.
    pub fn pack_fixed(&mut self, bytes: &[u8]) {
        if self.reserve(bytes.len()) {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Writes a `len:u32 ‖ bytes` field.
    pub fn pack_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() > MAX_FIELD_LEN {
            self.failed.get_or_insert(PackError::FieldTooLong {
                len: bytes.len(),
                max: MAX_FIELD_LEN,
            });
            return;
        }
        self.pack_u32(bytes.len() as u32);
        self.pack_fixed(bytes);
    }

    /// Writes a `count:u32` marker followed by each element.
    pub fn pack_seq<T>(&mut self, items: &[T], mut pack: impl FnMut(&mut Self, &T)) {
        self.pack_u32(items.len() as u32);
        for item in items {
            pack(self, item);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The packed bytes, or the first write failure.
    pub fn finish(self) -> Result<Vec<u8>, PackError> {
        match self.failed {
            Some(err) => Err(err),
            None => Ok(self.buf),
        }
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserializes fields from a byte slice.
#[derive(Debug)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], UnpackError> {
        if self.remaining() < n {
            return Err(UnpackError::ShortRead {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, UnpackError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, UnpackError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, UnpackError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, UnpackError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn unpack_bool(&mut self) -> Result<bool, UnpackError> {
        match self.unpack_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(UnpackError::BadBool(other)),
        }
    }

    /// Reads exactly `n` bytes with no length marker.
    pub fn unpack_fixed(&mut self, n: usize) -> Result<&'a [u8], UnpackError> {
        self.take(n)
    }

    /// Reads a `len:u32 ‖ bytes` field.
    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, UnpackError> {
        let len = self.unpack_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(UnpackError::FieldTooLong {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a `count:u32` marker and that many elements.
    pub fn unpack_seq<T>(
        &mut self,
        mut unpack: impl FnMut(&mut Self) -> Result<T, UnpackError>,
    ) -> Result<Vec<T>, UnpackError> {
        let count = self.unpack_u32()? as usize;
        if count > MAX_FIELD_LEN {
            return Err(UnpackError::FieldTooLong {
                len: count,
                max: MAX_FIELD_LEN,
            });
        }
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(unpack(self)?);
        }
        Ok(out)
    }

    /// Errors unless every byte has been consumed.
    pub fn finish(self) -> Result<(), UnpackError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(UnpackError::TrailingBytes(self.remaining()))
        }
    }
}
