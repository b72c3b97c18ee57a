//! Blake3 digests used for block ids, transaction ids and round seeds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw 256-bit digest.
pub type H256 = [u8; 32];

/// A 32-byte blake3 digest.
///
/// Ordering is plain lexicographic byte order, which is what fork
/// resolution uses to pick between two competing block ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub H256);

impl Hash {
    /// The all-zero digest, used as the parent id of genesis.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: H256) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &H256 {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string (an optional `0x` prefix is accepted).
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Hash of this digest's bytes. Used to walk a seed forward.
    pub fn rehash(&self) -> Hash {
        hash(&self.0)
    }

    /// Interpret the digest as four little-endian `u64` words.
    pub fn to_words(&self) -> [u64; 4] {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.0[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(chunk);
        }
        words
    }

    /// Read the `index`-th little-endian `u32` out of the digest (0..8).
    pub fn u32_at(&self, index: usize) -> u32 {
        let mut chunk = [0u8; 4];
        chunk.copy_from_slice(&self.0[index * 4..index * 4 + 4]);
        u32::from_le_bytes(chunk)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<H256> for Hash {
    fn from(bytes: H256) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash arbitrary data using Blake3.
pub fn hash(data: &[u8]) -> Hash {
    Hash(blake3::hash(data).into())
}

/// Hash several byte slices as if they were concatenated.
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"round 7"), hash(b"round 7"));
        assert_ne!(hash(b"round 7"), hash(b"round 8"));
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let h = hash(b"block");
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        assert_eq!(Hash::from_hex(&format!("0x{}", h.to_hex())).unwrap(), h);
        assert!(Hash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_hash_concat_matches_flat() {
        assert_eq!(hash_concat(&[b"dele", b"gate"]), hash(b"delegate"));
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[0] = 0x09;
        high[0] = 0x10;
        high[31] = 0x00;
        low[31] = 0xff;
        assert!(Hash(low) < Hash(high));
    }

    #[test]
    fn test_words_and_u32_views() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        bytes[8] = 2;
        bytes[4] = 3;
        let h = Hash(bytes);
        assert_eq!(h.to_words(), [1 | (3 << 32), 2, 0, 0]);
        assert_eq!(h.u32_at(0), 1);
        assert_eq!(h.u32_at(1), 3);
        assert_eq!(h.u32_at(2), 2);
    }

    #[test]
    fn test_rehash_walks_forward() {
        let seed = hash(b"seed");
        assert_eq!(seed.rehash(), hash(seed.as_bytes()));
        assert_ne!(seed.rehash(), seed);
    }
}
