//! Hashing helpers shared by the identifier types.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
#[must_use]
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// RIPEMD-160 of `data`. Used only to derive node identities from
/// certificate digests, mirroring the address-style derivation.
#[must_use]
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut h = Ripemd160::new();
    h.update(data);
    h.finalize().into()
}

/// The trailing `len` bytes of the SHA-256 of `data`.
///
/// # Panics
///
/// Panics if `len > 32`.
#[must_use]
pub fn checksum(data: &[u8], len: usize) -> Vec<u8> {
    assert!(len <= 32, "checksum length out of range");
    let digest = hash256(data);
    digest[32 - len..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let got = hash256(b"");
        let want = hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
            .unwrap();
        assert_eq!(got.as_slice(), want.as_slice());
    }

    #[test]
    fn ripemd160_known_vector() {
        let got = hash160(b"");
        let want = hex::decode("9c1185a5c5e9fc54612808977ee8f548b2258d31").unwrap();
        assert_eq!(got.as_slice(), want.as_slice());
    }

    #[test]
    fn checksum_is_hash_suffix() {
        let cs = checksum(b"firn", 4);
        assert_eq!(cs.as_slice(), &hash256(b"firn")[28..]);
    }
}
