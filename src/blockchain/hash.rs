use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest;

use std::fmt;
use std::str::FromStr;

/// Errors that can occur when parsing a block hash
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A digest produced by the proof-of-work hash function.
///
/// The width depends on the digest algorithm the chain is parameterized
/// over, so the bytes are kept on the heap. Genesis blocks link to the empty
/// hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(Vec<u8>);

impl BlockHash {
    /// The zero-length hash that genesis blocks point back to
    pub fn empty() -> Self {
        BlockHash(Vec::new())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        BlockHash(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Number of leading zero bits when read as a big-endian integer
    ///
    /// # Returns
    ///
    /// The full bit width for an all-zero hash, and 0 for the empty hash
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BlockHash(hex::decode(s)?))
    }
}

// Hashes travel as hex strings so stored records stay readable in JSON.
impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Bit width of the digest produced by `D`
pub fn hash_bits<D: Digest>() -> u32 {
    (<D as Digest>::output_size() * 8) as u32
}

/// Hashes `bytes` with the digest algorithm `D`
///
/// # Arguments
///
/// * `bytes` - The message to hash
///
/// # Returns
///
/// A hash of `hash_bits::<D>() / 8` bytes
pub fn digest<D: Digest>(bytes: &[u8]) -> BlockHash {
    BlockHash(D::digest(bytes).to_vec())
}
