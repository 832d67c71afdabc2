use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

/// Version tag folded into every job input hash. Bump whenever the hash
/// inputs or the cached artifact format change, to invalidate stale
/// on-disk caches written by older builds.
pub const CACHE_FORMAT_VERSION: &str = "shaderpipe-cache-v1";

/// A 32-byte content hash. Used both as the deterministic job input hash
/// (the cache and cross-process dedup key) and for output-code content
/// hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Hashes a single buffer. Output-code hashes use this directly.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Interprets both hashes as 256-bit little-endian integers and returns
    /// their wrapping sum. Addition is associative and commutative, so a
    /// combined hash built this way is stable under reordering of equal
    /// content.
    pub fn wide_add(&self, other: &ContentHash) -> ContentHash {
        let mut out = [0u8; 32];
        let mut carry = 0u16;
        for i in 0..32 {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        ContentHash(out)
    }

    /// 64 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            s.push(HEX[(byte >> 4) as usize] as char);
            s.push(HEX[(byte & 0xf) as usize] as char);
        }
        s
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
