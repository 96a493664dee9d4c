//! CB58: Base58 with a 4-byte SHA-256 checksum suffix.

use thiserror::Error;

use crate::hashing::checksum;

const CHECKSUM_LEN: usize = 4;

/// Errors produced while decoding a CB58 string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Cb58Error {
    #[error("not valid base58: {0}")]
    Base58(String),

    #[error("string shorter than the checksum")]
    MissingChecksum,

    #[error("checksum mismatch")]
    BadChecksum,
}

/// Encodes `bytes` as CB58.
#[must_use]
pub fn cb58_encode(bytes: &[u8]) -> String {
    let mut buf = Vec::with_capacity(bytes.len() + CHECKSUM_LEN);
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(&checksum(bytes, CHECKSUM_LEN));
    bs58::encode(buf).into_string()
}

/// Decodes a CB58 string, verifying its checksum.
pub fn cb58_decode(s: &str) -> Result<Vec<u8>, Cb58Error> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|e| Cb58Error::Base58(e.to_string()))?;
    if raw.len() < CHECKSUM_LEN {
        return Err(Cb58Error::MissingChecksum);
    }
    let (payload, given) = raw.split_at(raw.len() - CHECKSUM_LEN);
    if given != checksum(payload, CHECKSUM_LEN).as_slice() {
        return Err(Cb58Error::BadChecksum);
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let s = cb58_encode(&payload);
        assert_eq!(cb58_decode(&s).unwrap(), payload);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut s = cb58_encode(&[1, 2, 3]);
        // flip the final character to another base58 digit
        let last = s.pop().unwrap();
        s.push(if last == '2' { '3' } else { '2' });
        assert!(matches!(
            cb58_decode(&s),
            Err(Cb58Error::BadChecksum) | Err(Cb58Error::Base58(_))
        ));
    }

    #[test]
    fn too_short_rejected() {
        assert_eq!(cb58_decode("1"), Err(Cb58Error::MissingChecksum));
    }
}
